//! Command notifications.
//!
//! Every user-level robot command announces itself to subscribers before it
//! starts and again when it finishes, with the outcome. Subscribers only
//! observe; nothing they do changes the command.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::RobotResult;
use crate::types::{Location, Mount};

/// Handle returned by [`CommandPublisher::subscribe`].
pub type SubscriptionId = u64;

pub type CommandCallback = Arc<dyn Fn(&CommandMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStage {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Succeeded,
    Failed(String),
}

/// What a command is doing, in structured and human-readable form.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPayload {
    pub name: &'static str,
    pub mount: Option<Mount>,
    pub location: Option<Location>,
    pub volume: Option<f64>,
    pub rate: Option<f64>,
    pub text: String,
}

impl CommandPayload {
    pub fn new(name: &'static str, text: impl Into<String>) -> Self {
        Self {
            name,
            mount: None,
            location: None,
            volume: None,
            rate: None,
            text: text.into(),
        }
    }

    pub fn mount(mut self, mount: Mount) -> Self {
        self.mount = Some(mount);
        self
    }

    pub fn location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }

    pub fn volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn rate(mut self, rate: f64) -> Self {
        self.rate = Some(rate);
        self
    }
}

impl fmt::Display for CommandPayload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandMessage {
    pub stage: CommandStage,
    pub payload: CommandPayload,
    /// Set on `After` messages only
    pub outcome: Option<CommandOutcome>,
}

#[derive(Clone, Default)]
pub struct CommandPublisher {
    callbacks: Arc<Mutex<HashMap<SubscriptionId, CommandCallback>>>,
    next_id: Arc<Mutex<SubscriptionId>>,
}

impl fmt::Debug for CommandPublisher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CommandPublisher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CommandPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&CommandMessage) + Send + Sync + 'static,
    {
        let mut callbacks = lock(&self.callbacks);
        let mut next_id = lock(&self.next_id);

        let id = *next_id;
        *next_id += 1;

        callbacks.insert(id, Arc::new(callback));
        id
    }

    /// Returns false if the subscription was not active.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.callbacks).remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.callbacks).len()
    }

    fn emit(&self, message: &CommandMessage) {
        // Snapshot so a callback may (un)subscribe without deadlocking.
        let callbacks: Vec<CommandCallback> = lock(&self.callbacks).values().cloned().collect();
        for callback in callbacks {
            callback(message);
        }
    }

    pub fn before(&self, payload: &CommandPayload) {
        self.emit(&CommandMessage {
            stage: CommandStage::Before,
            payload: payload.clone(),
            outcome: None,
        });
    }

    pub fn after<T>(&self, payload: &CommandPayload, result: &RobotResult<T>) {
        let outcome = match result {
            Ok(_) => CommandOutcome::Succeeded,
            Err(e) => CommandOutcome::Failed(e.to_string()),
        };
        self.emit(&CommandMessage {
            stage: CommandStage::After,
            payload: payload.clone(),
            outcome: Some(outcome),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RobotError;

    #[test]
    fn test_subscribe_receives_before_and_after() {
        let publisher = CommandPublisher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        publisher.subscribe(move |msg| sink.lock().unwrap().push(msg.clone()));

        let payload = CommandPayload::new("home", "Homing").mount(Mount::Left);
        publisher.before(&payload);
        publisher.after(&payload, &Ok::<(), RobotError>(()));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].stage, CommandStage::Before);
        assert_eq!(seen[0].outcome, None);
        assert_eq!(seen[1].outcome, Some(CommandOutcome::Succeeded));
        assert_eq!(seen[1].payload.to_string(), "Homing");
    }

    #[test]
    fn test_failure_outcome_carries_message() {
        let publisher = CommandPublisher::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        publisher.subscribe(move |msg| *sink.lock().unwrap() = msg.outcome.clone());

        let result: RobotResult<()> = Err(RobotError::OutOfTips);
        publisher.after(&CommandPayload::new("pick_up_tip", "Picking up tip"), &result);
        assert!(matches!(
            seen.lock().unwrap().as_ref(),
            Some(CommandOutcome::Failed(msg)) if msg.contains("no tips")
        ));
    }

    #[test]
    fn test_unsubscribe() {
        let publisher = CommandPublisher::new();
        let id = publisher.subscribe(|_| {});
        assert_eq!(publisher.subscriber_count(), 1);
        assert!(publisher.unsubscribe(id));
        assert!(!publisher.unsubscribe(id));
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
