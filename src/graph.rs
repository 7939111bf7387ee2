//! Dependency-ordered task executor
//!
//! A [`TaskGraph`] holds named futures together with the ids they must wait
//! for. Running it starts every task whose predecessors have completed and
//! keeps going until all tasks finish or one fails. There is no fan-out
//! limit: everything that is ready runs concurrently.
//!
//! The first failure cancels the run token and is returned; tasks still in
//! flight are dropped. Nothing is rolled back.
//!
//! ```ignore
//! let mut graph = TaskGraph::new();
//! graph.add("namespace", &[], async { Ok(()) });
//! graph.add("rbac", &["namespace"], async { Ok(()) });
//! let completed = graph.run(&cancel).await?;
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{Error, Result};

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

struct Node<K> {
    id: K,
    after: Vec<K>,
    future: TaskFuture,
}

/// Static graph of tasks keyed by `K`
pub struct TaskGraph<K> {
    nodes: Vec<Node<K>>,
}

impl<K> Default for TaskGraph<K> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

async fn labelled<K>(id: K, future: TaskFuture) -> (K, Result<()>) {
    (id, future.await)
}

impl<K> TaskGraph<K>
where
    K: Copy + Eq + Hash + Debug + Send + 'static,
{
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task that starts once every id in `after` has completed
    pub fn add<F>(&mut self, id: K, after: &[K], future: F) -> &mut Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.nodes.push(Node {
            id,
            after: after.to_vec(),
            future: Box::pin(future),
        });
        self
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no tasks
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Predecessors declared for `id`
    pub fn predecessors(&self, id: K) -> Option<&[K]> {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.after.as_slice())
    }

    /// A valid execution order, preferring insertion order among ready tasks.
    ///
    /// Fails on duplicate ids, unknown predecessors and cycles.
    pub fn order(&self) -> Result<Vec<K>> {
        let mut seen: Vec<K> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if seen.contains(&node.id) {
                return Err(Error::graph(format!("task {:?} added twice", node.id)));
            }
            seen.push(node.id);
        }
        for node in &self.nodes {
            if let Some(missing) = node.after.iter().find(|p| !seen.contains(p)) {
                return Err(Error::graph(format!(
                    "task {:?} depends on unknown task {:?}",
                    node.id, missing
                )));
            }
        }

        let mut order: Vec<K> = Vec::with_capacity(self.nodes.len());
        while order.len() < self.nodes.len() {
            let next = self.nodes.iter().find(|n| {
                !order.contains(&n.id) && n.after.iter().all(|p| order.contains(p))
            });
            match next {
                Some(node) => order.push(node.id),
                None => {
                    let stuck: Vec<K> = self
                        .nodes
                        .iter()
                        .map(|n| n.id)
                        .filter(|id| !order.contains(id))
                        .collect();
                    return Err(Error::graph(format!("dependency cycle among {:?}", stuck)));
                }
            }
        }
        Ok(order)
    }

    /// Run every task, returning ids in completion order
    pub async fn run(self, cancel: &CancellationToken) -> Result<Vec<K>> {
        let order = self.order()?;

        let mut waiting: HashMap<K, usize> = HashMap::new();
        let mut dependents: HashMap<K, Vec<K>> = HashMap::new();
        let mut futures: HashMap<K, TaskFuture> = HashMap::new();
        for node in self.nodes {
            waiting.insert(node.id, node.after.len());
            for pred in &node.after {
                dependents.entry(*pred).or_default().push(node.id);
            }
            futures.insert(node.id, node.future);
        }

        let mut running = FuturesUnordered::new();
        for id in &order {
            if waiting.get(id) == Some(&0) {
                if let Some(future) = futures.remove(id) {
                    debug!(task = ?id, "starting task");
                    running.push(labelled(*id, future));
                }
            }
        }

        let mut completed = Vec::with_capacity(order.len());
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::cancelled("task graph")),
                next = running.next() => next,
            };
            let Some((id, outcome)) = next else {
                break;
            };

            if let Err(e) = outcome {
                error!(task = ?id, error = %e, "task failed, aborting run");
                cancel.cancel();
                return Err(e);
            }
            debug!(task = ?id, "task complete");
            completed.push(id);

            for dependent in dependents.remove(&id).unwrap_or_default() {
                let Some(count) = waiting.get_mut(&dependent) else {
                    continue;
                };
                *count -= 1;
                if *count == 0 {
                    if let Some(future) = futures.remove(&dependent) {
                        debug!(task = ?dependent, "starting task");
                        running.push(labelled(dependent, future));
                    }
                }
            }
        }

        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn step(log: &Log, name: &'static str, delay_ms: u64) -> impl Future<Output = Result<()>> {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(format!("start {}", name));
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            log.lock().unwrap().push(format!("end {}", name));
            Ok(())
        }
    }

    fn position(log: &Log, entry: &str) -> usize {
        log.lock()
            .unwrap()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{} not logged", entry))
    }

    #[tokio::test]
    async fn dependents_start_after_predecessors_finish() {
        let log: Log = Arc::default();
        let mut graph = TaskGraph::new();
        graph
            .add("a", &[], step(&log, "a", 20))
            .add("b", &[], step(&log, "b", 1))
            .add("c", &["a", "b"], step(&log, "c", 1))
            .add("d", &["c"], step(&log, "d", 1));

        let completed = graph.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(completed.len(), 4);
        assert_eq!(completed[2..], ["c", "d"]);
        assert!(position(&log, "start c") > position(&log, "end a"));
        assert!(position(&log, "start c") > position(&log, "end b"));
        assert!(position(&log, "start d") > position(&log, "end c"));
    }

    #[tokio::test]
    async fn independent_tasks_overlap() {
        let log: Log = Arc::default();
        let mut graph = TaskGraph::new();
        graph
            .add(1, &[], step(&log, "one", 20))
            .add(2, &[], step(&log, "two", 20));
        graph.run(&CancellationToken::new()).await.unwrap();

        assert!(position(&log, "start two") < position(&log, "end one"));
    }

    #[tokio::test]
    async fn failure_cancels_token_and_skips_dependents() {
        let log: Log = Arc::default();
        let cancel = CancellationToken::new();
        let mut graph = TaskGraph::new();
        graph
            .add("bad", &[], async { Err(Error::internal("boom")) })
            .add("slow", &[], step(&log, "slow", 200))
            .add("after", &["bad"], step(&log, "after", 1));

        let err = graph.run(&cancel).await.unwrap_err();

        assert!(err.to_string().contains("boom"));
        assert!(cancel.is_cancelled());
        let log = log.lock().unwrap();
        assert!(!log.contains(&"start after".to_string()));
        assert!(!log.contains(&"end slow".to_string()));
    }

    #[tokio::test]
    async fn external_cancellation_stops_the_run() {
        let cancel = CancellationToken::new();
        let mut graph = TaskGraph::new();
        graph.add("forever", &[], async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = graph.run(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn unknown_predecessor_is_rejected() {
        let mut graph = TaskGraph::new();
        graph.add("a", &["ghost"], async { Ok(()) });
        let err = graph.order().unwrap_err();
        assert!(matches!(err, Error::Graph { .. }));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn cycles_and_duplicates_are_rejected() {
        let mut graph = TaskGraph::new();
        graph
            .add("a", &["b"], async { Ok(()) })
            .add("b", &["a"], async { Ok(()) });
        assert!(graph.order().unwrap_err().to_string().contains("cycle"));

        let mut graph = TaskGraph::new();
        graph.add("a", &[], async { Ok(()) }).add("a", &[], async { Ok(()) });
        assert!(graph.order().unwrap_err().to_string().contains("twice"));
    }

    #[test]
    fn order_prefers_insertion_among_ready_tasks() {
        let mut graph = TaskGraph::new();
        graph
            .add("late", &["first"], async { Ok(()) })
            .add("first", &[], async { Ok(()) })
            .add("second", &[], async { Ok(()) });
        assert_eq!(graph.order().unwrap(), vec!["first", "late", "second"]);
    }

    #[tokio::test]
    async fn empty_graph_completes() {
        let graph: TaskGraph<u8> = TaskGraph::new();
        assert!(graph.run(&CancellationToken::new()).await.unwrap().is_empty());
    }
}
