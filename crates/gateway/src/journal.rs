//! Ordered, best-effort access to chat transcripts.
//!
//! Every transcript read and append from every session goes through one
//! writer task, so a transcript reflects the order in which lines were
//! recorded and a fresh pairing always sees every line recorded before it.
//! Recording never waits on the database; failures are logged and dropped.

use std::sync::Arc;

use {
    duet_store::{HistoryStore, PairKey},
    tokio::sync::{mpsc, oneshot},
    tracing::{debug, warn},
};

enum JournalOp {
    Append { key: PairKey, line: String },
    Load {
        key: PairKey,
        reply: oneshot::Sender<Option<String>>,
    },
    Create { key: PairKey },
}

/// Handle to the transcript writer task.
#[derive(Clone)]
pub struct HistoryJournal {
    tx: mpsc::UnboundedSender<JournalOp>,
}

impl HistoryJournal {
    pub fn spawn(store: Arc<dyn HistoryStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(store, rx));
        Self { tx }
    }

    /// Queue `line` for the pair's transcript. Never blocks.
    pub fn record(&self, key: PairKey, line: String) {
        self.submit(JournalOp::Append { key, line });
    }

    /// Queue creation of the pair's empty record. Lines already recorded
    /// for the pair are kept.
    pub fn create(&self, key: PairKey) {
        self.submit(JournalOp::Create { key });
    }

    /// Fetch the pair's transcript once all earlier lines are stored.
    ///
    /// `None` means the pair never had a record. Storage failures also
    /// yield `None`.
    pub async fn load(&self, key: PairKey) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(JournalOp::Load { key, reply }).ok()?;
        rx.await.ok().flatten()
    }

    fn submit(&self, op: JournalOp) {
        if self.tx.send(op).is_err() {
            warn!("history journal stopped, update dropped");
        }
    }
}

async fn run(store: Arc<dyn HistoryStore>, mut rx: mpsc::UnboundedReceiver<JournalOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            JournalOp::Append { key, line } => {
                if let Err(e) = store.append(&key, &line).await {
                    warn!(pair = %key, error = %e, "failed to append to history");
                }
            },
            JournalOp::Load { key, reply } => {
                let transcript = store.get(&key).await.unwrap_or_else(|e| {
                    warn!(pair = %key, error = %e, "failed to load history");
                    None
                });
                let _ = reply.send(transcript);
            },
            JournalOp::Create { key } => {
                debug!(pair = %key, "first pairing, creating history");
                if let Err(e) = store.create_empty(&key).await {
                    warn!(pair = %key, error = %e, "failed to create history");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, duet_store::InMemoryHistoryStore};

    #[tokio::test]
    async fn load_sees_every_prior_append() {
        let journal = HistoryJournal::spawn(Arc::new(InMemoryHistoryStore::new()));
        let key = PairKey::new("alice", "bob");

        assert_eq!(journal.load(key.clone()).await, None);
        journal.create(key.clone());
        for (who, text) in [("alice", "m1"), ("bob", "m2"), ("alice", "m3")] {
            journal.record(key.clone(), format!("{who}> {text}\n"));
        }
        assert_eq!(
            journal.load(PairKey::new("bob", "alice")).await.as_deref(),
            Some("alice> m1\nbob> m2\nalice> m3\n")
        );
    }

    #[tokio::test]
    async fn load_does_not_create_a_record() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let journal = HistoryJournal::spawn(store.clone());
        let key = PairKey::new("a", "b");
        assert_eq!(journal.load(key.clone()).await, None);
        assert_eq!(journal.load(key.clone()).await, None);
        assert_eq!(store.get(&key).await.unwrap(), None);

        journal.create(key.clone());
        assert_eq!(journal.load(key).await.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn create_after_a_recorded_line_keeps_it() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let journal = HistoryJournal::spawn(store);
        let key = PairKey::new("alice", "bob");
        journal.record(key.clone(), "alice> hi\n".into());
        journal.create(key.clone());
        assert_eq!(journal.load(key).await.as_deref(), Some("alice> hi\n"));
    }
}
