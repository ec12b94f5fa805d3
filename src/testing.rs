//! Recording test double for the device shell and the control plane.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{
    error::{Error, Result},
    hass::{ControlPlane, EntityState},
    remote::Shell,
};

/// Records every side effect in order and answers reads from scripts.
///
/// Scripted values are consumed front to back; the last one sticks.
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<String>>,
    states: Mutex<HashMap<String, VecDeque<String>>>,
    attributes: Mutex<HashMap<String, Map<String, Value>>>,
    replies: Mutex<Vec<(String, VecDeque<Option<String>>)>>,
    connected: AtomicBool,
    refuse_connect: AtomicBool,
}

fn next<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

impl Recorder {
    pub fn connected() -> Self {
        let recorder = Self::default();
        recorder.connected.store(true, Ordering::SeqCst);
        recorder
    }

    pub fn script(&self, entity_id: &str, states: &[&str]) {
        self.states.lock().unwrap().insert(
            entity_id.to_owned(),
            states.iter().map(|state| (*state).to_owned()).collect(),
        );
    }

    pub fn set_attributes(&self, entity_id: &str, attributes: Value) {
        let Value::Object(attributes) = attributes else {
            panic!("attributes must be an object");
        };
        self.attributes
            .lock()
            .unwrap()
            .insert(entity_id.to_owned(), attributes);
    }

    /// Scripts replies to shell commands starting with `prefix`, replacing
    /// earlier replies for the same prefix.
    pub fn reply(&self, prefix: &str, replies: &[Option<&str>]) {
        let mut scripted = self.replies.lock().unwrap();
        scripted.retain(|(existing, _)| existing != prefix);
        scripted.push((
            prefix.to_owned(),
            replies
                .iter()
                .map(|reply| reply.map(ToOwned::to_owned))
                .collect(),
        ));
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|candidate| *candidate == call).count()
    }

    pub fn position(&self, call: &str) -> Option<usize> {
        self.calls().iter().position(|candidate| candidate == call)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Shell for Recorder {
    async fn connect(&self) -> Result<()> {
        self.record("connect".to_owned());
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(Error::unavailable("refused"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, command: &str, _timeout: Duration) -> Option<String> {
        if !self.connected.load(Ordering::SeqCst) {
            return None;
        }
        self.record(format!("shell {command}"));

        let mut replies = self.replies.lock().unwrap();
        let reply = replies
            .iter_mut()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .and_then(|(_, queue)| next(queue));

        match reply {
            Some(Some(output)) => Some(output),
            Some(None) => {
                self.connected.store(false, Ordering::SeqCst);
                None
            }
            None => Some(String::new()),
        }
    }

    async fn disconnect(&self) {
        self.record("disconnect".to_owned());
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(10)
    }
}

#[async_trait]
impl ControlPlane for Recorder {
    async fn state(&self, entity_id: &str) -> Result<EntityState> {
        let state = self
            .states
            .lock()
            .unwrap()
            .get_mut(entity_id)
            .and_then(next)
            .ok_or_else(|| Error::not_found(entity_id.to_owned()))?;

        Ok(EntityState {
            entity_id: entity_id.to_owned(),
            state,
            attributes: self
                .attributes
                .lock()
                .unwrap()
                .get(entity_id)
                .cloned()
                .unwrap_or_default(),
        })
    }

    async fn states(&self) -> Result<Vec<EntityState>> {
        let ids: Vec<String> = self.states.lock().unwrap().keys().cloned().collect();
        let mut states = Vec::with_capacity(ids.len());
        // Entities scripted without states do not exist.
        for id in ids {
            if let Ok(state) = self.state(&id).await {
                states.push(state);
            }
        }
        Ok(states)
    }

    async fn call_service(&self, domain: &str, service: &str, data: Value) -> Result<()> {
        let target = data["entity_id"]
            .as_str()
            .or_else(|| data["path"].as_str())
            .unwrap_or_default()
            .to_owned();

        // Booleans remember what was written, like the real thing.
        if domain == "input_boolean" {
            let state = if service == "turn_on" { "on" } else { "off" };
            self.script(&target, &[state]);
        }

        self.record(format!("{domain}.{service} {target}"));
        Ok(())
    }
}
