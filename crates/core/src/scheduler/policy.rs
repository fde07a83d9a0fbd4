use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use coordinator_common::ids::ProjectId;
use coordinator_common::types::Task;

/// Selection policy chosen at startup or via `daemon.reload` (spec.md §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionPolicy {
    Fifo,
    Priority,
    RoundRobin,
    WeightedFair,
    DeadlineAware,
}

impl SelectionPolicy {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "fifo" => Self::Fifo,
            "priority" => Self::Priority,
            "round-robin" => Self::RoundRobin,
            "weighted-fair" => Self::WeightedFair,
            "deadline-aware" => Self::DeadlineAware,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Priority => "priority",
            Self::RoundRobin => "round-robin",
            Self::WeightedFair => "weighted-fair",
            Self::DeadlineAware => "deadline-aware",
        }
    }
}

/// Mutable policy bookkeeping that must persist across `select()` calls:
/// the round-robin cursor and the weighted-fair deficit-token balances
/// (spec.md §4.4). Kept inside the scheduler's single critical section.
#[derive(Default)]
pub struct PolicyState {
    pub round_robin_cursor: usize,
    pub weighted_balances: HashMap<ProjectId, f64>,
}

/// Pick the index of the next task to run from `queue`, or `None` if the
/// queue has nothing ready. `share_weights` supplies each project's
/// weighted-fair share weight (spec.md §3 "Share weight").
pub fn select(
    policy: SelectionPolicy,
    queue: &VecDeque<Task>,
    share_weights: &HashMap<ProjectId, f64>,
    state: &mut PolicyState,
    now: DateTime<Utc>,
    deadline_window: Duration,
) -> Option<usize> {
    if queue.is_empty() {
        return None;
    }

    match policy {
        SelectionPolicy::Fifo => select_fifo(queue),
        SelectionPolicy::Priority => select_priority(queue),
        SelectionPolicy::RoundRobin => select_round_robin(queue, state),
        SelectionPolicy::WeightedFair => select_weighted_fair(queue, share_weights, state),
        SelectionPolicy::DeadlineAware => select_deadline_aware(queue, now, deadline_window),
    }
}

fn select_fifo(queue: &VecDeque<Task>) -> Option<usize> {
    queue
        .iter()
        .enumerate()
        .min_by_key(|(_, t)| t.arrival)
        .map(|(i, _)| i)
}

fn select_priority(queue: &VecDeque<Task>) -> Option<usize> {
    queue
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.arrival.cmp(&a.arrival)))
        .map(|(i, _)| i)
}

/// Distinct projects represented in the queue, in a stable (sorted) order so
/// the round-robin cursor has a consistent ring to index into.
fn ready_projects(queue: &VecDeque<Task>) -> Vec<ProjectId> {
    let mut projects: Vec<ProjectId> = queue.iter().map(|t| t.project_id.clone()).collect();
    projects.sort();
    projects.dedup();
    projects
}

fn select_round_robin(queue: &VecDeque<Task>, state: &mut PolicyState) -> Option<usize> {
    let projects = ready_projects(queue);
    if projects.is_empty() {
        return None;
    }

    let len = projects.len();
    if state.round_robin_cursor >= len {
        state.round_robin_cursor = 0;
    }

    for step in 0..len {
        let idx = (state.round_robin_cursor + step) % len;
        let project = &projects[idx];
        if let Some(task_idx) = oldest_task_index_for(queue, project) {
            state.round_robin_cursor = (idx + 1) % len;
            return Some(task_idx);
        }
    }

    None
}

fn oldest_task_index_for(queue: &VecDeque<Task>, project: &ProjectId) -> Option<usize> {
    queue
        .iter()
        .enumerate()
        .filter(|(_, t)| &t.project_id == project)
        .min_by_key(|(_, t)| t.arrival)
        .map(|(i, _)| i)
}

/// Deficit-token weighted-fair selection (spec.md §4.4 "Weighted-fair").
fn select_weighted_fair(
    queue: &VecDeque<Task>,
    share_weights: &HashMap<ProjectId, f64>,
    state: &mut PolicyState,
) -> Option<usize> {
    let projects = ready_projects(queue);
    if projects.is_empty() {
        return None;
    }

    for project in &projects {
        state
            .weighted_balances
            .entry(project.clone())
            .or_insert_with(|| share_weights.get(project).copied().unwrap_or(1.0));
    }

    let winner = projects
        .iter()
        .max_by(|a, b| {
            let balance_a = state.weighted_balances[*a];
            let balance_b = state.weighted_balances[*b];
            balance_a
                .partial_cmp(&balance_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let oldest_a = oldest_task_index_for(queue, a).map(|i| queue[i].arrival);
                    let oldest_b = oldest_task_index_for(queue, b).map(|i| queue[i].arrival);
                    // Earlier arrival wins ties, so reverse the natural ordering.
                    oldest_b.cmp(&oldest_a)
                })
        })?
        .clone();

    let task_idx = oldest_task_index_for(queue, &winner)?;

    if let Some(balance) = state.weighted_balances.get_mut(&winner) {
        *balance -= 1.0;
    }

    let all_depleted = projects
        .iter()
        .all(|p| state.weighted_balances.get(p).copied().unwrap_or(0.0) <= 0.0);
    if all_depleted {
        for project in &projects {
            let refill = share_weights.get(project).copied().unwrap_or(1.0);
            state.weighted_balances.insert(project.clone(), refill);
        }
    }

    Some(task_idx)
}

fn select_deadline_aware(queue: &VecDeque<Task>, now: DateTime<Utc>, window: Duration) -> Option<usize> {
    let horizon = now + window;
    let urgent = queue
        .iter()
        .enumerate()
        .filter(|(_, t)| t.deadline.map(|d| d < horizon).unwrap_or(false))
        .min_by_key(|(_, t)| t.deadline);

    match urgent {
        Some((i, _)) => Some(i),
        None => select_priority(queue),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_common::ids::IssueId;

    fn task(project: &str, issue: &str, priority: u8) -> Task {
        Task::new(ProjectId::new(project), IssueId::new(issue), "lint", priority)
    }

    #[test]
    fn fifo_picks_oldest_arrival() {
        let mut queue = VecDeque::new();
        queue.push_back(task("p1", "1", 10));
        std::thread::sleep(std::time::Duration::from_millis(2));
        queue.push_back(task("p1", "2", 90));

        let idx = select_fifo(&queue).unwrap();
        assert_eq!(queue[idx].issue_id, IssueId::new("1"));
    }

    #[test]
    fn priority_picks_highest_then_fifo() {
        let mut queue = VecDeque::new();
        queue.push_back(task("p1", "1", 10));
        queue.push_back(task("p1", "2", 90));
        queue.push_back(task("p1", "3", 90));

        let idx = select_priority(&queue).unwrap();
        // Both "2" and "3" share priority 90; FIFO breaks the tie toward "2".
        assert_eq!(queue[idx].issue_id, IssueId::new("2"));
    }

    #[test]
    fn round_robin_cycles_through_every_backlogged_project() {
        let mut queue = VecDeque::new();
        queue.push_back(task("p1", "1", 0));
        queue.push_back(task("p2", "2", 0));
        queue.push_back(task("p3", "3", 0));

        let mut state = PolicyState::default();
        let weights = HashMap::new();
        let now = Utc::now();
        let window = Duration::hours(24);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let idx = select(SelectionPolicy::RoundRobin, &queue, &weights, &mut state, now, window).unwrap();
            seen.push(queue[idx].project_id.clone());
            queue.remove(idx);
        }

        seen.sort();
        assert_eq!(
            seen,
            vec![ProjectId::new("p1"), ProjectId::new("p2"), ProjectId::new("p3")]
        );
    }

    #[test]
    fn weighted_fair_converges_to_share_ratio() {
        let mut queue = VecDeque::new();
        for i in 0..100 {
            if i % 2 == 0 {
                queue.push_back(task("p1", &format!("p1-{i}"), 0));
            } else {
                queue.push_back(task("p2", &format!("p2-{i}"), 0));
            }
        }

        let mut weights = HashMap::new();
        weights.insert(ProjectId::new("p1"), 3.0);
        weights.insert(ProjectId::new("p2"), 1.0);

        let mut state = PolicyState::default();
        let now = Utc::now();
        let window = Duration::hours(24);

        let mut p1_count = 0;
        let mut p2_count = 0;
        for _ in 0..80 {
            let idx = select(SelectionPolicy::WeightedFair, &queue, &weights, &mut state, now, window).unwrap();
            if queue[idx].project_id == ProjectId::new("p1") {
                p1_count += 1;
            } else {
                p2_count += 1;
            }
            queue.remove(idx);
        }

        assert!((p1_count - 60i32).abs() <= 1, "p1_count = {p1_count}");
        assert!((p2_count - 20i32).abs() <= 1, "p2_count = {p2_count}");
    }

    #[test]
    fn deadline_aware_prefers_near_deadline_over_priority() {
        let mut queue = VecDeque::new();
        let urgent = task("p1", "1", 10).with_deadline(Utc::now() + Duration::hours(1));
        let low_priority_far = task("p1", "2", 90);
        queue.push_back(low_priority_far);
        queue.push_back(urgent);

        let mut state = PolicyState::default();
        let weights = HashMap::new();
        let idx = select(
            SelectionPolicy::DeadlineAware,
            &queue,
            &weights,
            &mut state,
            Utc::now(),
            Duration::hours(24),
        )
        .unwrap();

        assert_eq!(queue[idx].issue_id, IssueId::new("1"));
    }

    #[test]
    fn deadline_aware_falls_back_to_priority_when_no_near_deadline() {
        let mut queue = VecDeque::new();
        queue.push_back(task("p1", "1", 10));
        queue.push_back(task("p1", "2", 90));

        let mut state = PolicyState::default();
        let weights = HashMap::new();
        let idx = select(
            SelectionPolicy::DeadlineAware,
            &queue,
            &weights,
            &mut state,
            Utc::now(),
            Duration::hours(24),
        )
        .unwrap();

        assert_eq!(queue[idx].issue_id, IssueId::new("2"));
    }
}
