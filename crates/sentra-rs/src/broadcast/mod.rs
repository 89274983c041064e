use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Default)]
struct SessionChannel {
    log: Vec<String>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<String>)>,
    closed: bool,
}

#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

#[derive(Clone, Default)]
pub struct BroadcastHub {
    channels: Arc<RwLock<HashMap<Uuid, Arc<Mutex<SessionChannel>>>>>,
    next_id: Arc<AtomicU64>,
}

impl BroadcastHub {
    async fn channel(&self, session_id: Uuid) -> Arc<Mutex<SessionChannel>> {
        if let Some(ch) = self.channels.read().await.get(&session_id) {
            return ch.clone();
        }
        self.channels
            .write()
            .await
            .entry(session_id)
            .or_default()
            .clone()
    }

    pub async fn connect(&self, session_id: Uuid) -> Subscription {
        let channel = self.channel(session_id).await;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // replay and registration under one lock: no gap, no duplicate
        let mut ch = channel.lock().await;
        for line in &ch.log {
            let _ = tx.send(line.clone());
        }
        if !ch.closed {
            ch.subscribers.push((id, tx));
        }

        Subscription { id, rx }
    }

    pub async fn broadcast(&self, session_id: Uuid, line: impl Into<String>) {
        let line = line.into();
        let channel = self.channel(session_id).await;
        let mut ch = channel.lock().await;
        // a dead observer is dropped here, never waited on
        ch.subscribers.retain(|(_, tx)| tx.send(line.clone()).is_ok());
        ch.log.push(line);
    }

    pub async fn disconnect(&self, session_id: Uuid, subscriber: u64) {
        let Some(channel) = self.channels.read().await.get(&session_id).cloned() else {
            return;
        };
        channel
            .lock()
            .await
            .subscribers
            .retain(|(id, _)| *id != subscriber);
    }

    /// Ends live delivery for a finished session. The log stays available for replay.
    pub async fn close(&self, session_id: Uuid) {
        let channel = self.channel(session_id).await;
        let mut ch = channel.lock().await;
        ch.closed = true;
        ch.subscribers.clear();
    }

    /// Seeds and closes the channel of a session that finished before this process started.
    pub async fn restore<I>(&self, session_id: Uuid, lines: I)
    where
        I: IntoIterator<Item = String>,
    {
        let channel = self.channel(session_id).await;
        let mut ch = channel.lock().await;
        if !ch.log.is_empty() || ch.closed {
            return;
        }
        ch.log.extend(lines);
        ch.closed = true;
    }

    pub async fn remove(&self, session_id: Uuid) {
        if let Some(channel) = self.channels.write().await.remove(&session_id) {
            channel.lock().await.subscribers.clear();
        }
    }

    #[cfg(test)]
    pub async fn history(&self, session_id: Uuid) -> Vec<String> {
        match self.channels.read().await.get(&session_id) {
            Some(ch) => ch.lock().await.log.clone(),
            None => vec![],
        }
    }

    pub async fn subscriber_count(&self, session_id: Uuid) -> usize {
        match self.channels.read().await.get(&session_id) {
            Some(ch) => ch.lock().await.subscribers.len(),
            None => 0,
        }
    }
}
