//! Exercises the exact byte sequence of scenario S6 from the framing spec:
//! two frames concatenated in a single write must be processed as exactly
//! two messages, in order, with no residual bytes.
use coordinator_protocol::frame::{read_frame, write_frame};
use coordinator_protocol::message::Message;
use serde_json::Value;

#[tokio::test]
async fn two_concatenated_frames_are_processed_in_order() {
    let auth = Message::auth("t");
    let command = Message::command("req-1", "daemon.status", Value::Null);

    let mut buf = Vec::new();
    write_frame(&mut buf, &auth.to_bytes().unwrap()).await.unwrap();
    write_frame(&mut buf, &command.to_bytes().unwrap()).await.unwrap();

    let mut cursor = std::io::Cursor::new(buf);

    let first = read_frame(&mut cursor).await.unwrap();
    match Message::from_bytes(&first).unwrap() {
        Message::Auth { token, .. } => assert_eq!(token, "t"),
        other => panic!("expected auth, got {other:?}"),
    }

    let second = read_frame(&mut cursor).await.unwrap();
    match Message::from_bytes(&second).unwrap() {
        Message::Command { command, id, .. } => {
            assert_eq!(command, "daemon.status");
            assert_eq!(id, "req-1");
        }
        other => panic!("expected command, got {other:?}"),
    }

    assert_eq!(cursor.position() as usize, cursor.get_ref().len());
}
