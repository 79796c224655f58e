//! Software interlocks: named groups of relays of which at most one may be
//! ON at any time. Membership is static after boot; the gate is a plain
//! "all others OFF" scan.

use crate::models::OnOff;
use crate::relay::Relay;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

#[derive(Default)]
pub struct InterlockManager {
    groups: Mutex<HashMap<String, Vec<Weak<Relay>>>>,
}

impl InterlockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(InterlockManager::default())
    }

    pub fn register(&self, relay: &Arc<Relay>, group_names: &[String]) {
        let mut groups = self.groups.lock().unwrap();
        for group in group_names {
            groups
                .entry(group.clone())
                .or_default()
                .push(Arc::downgrade(relay));
        }
    }

    /// Allowed only if every other member of every named group is OFF.
    pub fn can_turn_on(&self, relay: &Relay, group_names: &[String]) -> bool {
        let groups = self.groups.lock().unwrap();
        for group in group_names {
            for member in groups.get(group).into_iter().flatten() {
                let Some(member) = member.upgrade() else {
                    continue;
                };
                if member.id != relay.id && member.state() == OnOff::On {
                    return false;
                }
            }
        }
        true
    }
}
