//! The stack abstraction: one addressable device tree hanging off one
//! transport (USB Brick, SPI Bricklet port, mesh network).

use std::collections::HashMap;

use tfp::Packet;

/// Opaque route key a stack stores per UID. USB and SPI stacks don't need
/// one and store zeros; mesh stacks store the node's 6-byte mesh address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Recipient {
    pub opaque: [u8; 6],
}

impl Recipient {
    pub fn from_address(address: [u8; 6]) -> Self {
        Self { opaque: address }
    }
}

/// Outcome of handing a request to a stack.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchResult {
    /// The transport took ownership and will deliver or queue the request.
    Accepted,
    /// Broadcast to a stack that has no matching UID; not an error.
    Dropped,
    /// Fatal for this request; the router logs and discards it.
    Error(String),
}

/// UID-to-route table. Append-only with last-write-wins on the opaque key;
/// entries only disappear on enumerate-disconnected or stack destruction.
#[derive(Default)]
pub struct RecipientTable {
    entries: HashMap<u32, Recipient>,
}

impl RecipientTable {
    pub fn add(&mut self, uid: u32, recipient: Recipient) {
        self.entries.insert(uid, recipient);
    }

    /// Insert with a zero route only if the UID is unknown, keeping a route
    /// the transport may have stored already.
    pub fn add_if_missing(&mut self, uid: u32) {
        self.entries.entry(uid).or_default();
    }

    pub fn get(&self, uid: u32) -> Option<Recipient> {
        self.entries.get(&uid).copied()
    }

    pub fn remove(&mut self, uid: u32) -> bool {
        self.entries.remove(&uid).is_some()
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.entries.contains_key(&uid)
    }

    pub fn uids(&self) -> Vec<u32> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// State shared by every stack implementation.
pub struct StackBase {
    pub name: String,
    pub recipients: RecipientTable,
}

impl StackBase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            recipients: RecipientTable::default(),
        }
    }
}

pub trait Stack: Send {
    fn base(&self) -> &StackBase;

    fn base_mut(&mut self) -> &mut StackBase;

    /// Hand a request to the transport. `recipient` is present iff the
    /// router found the UID in this stack's recipient table.
    fn dispatch(&mut self, request: &Packet, recipient: Option<Recipient>) -> DispatchResult;

    /// Escape hatch for transport-internal events that need the concrete
    /// stack back (e.g. the USB write queue drain).
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    fn name(&self) -> &str {
        &self.base().name
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Stack double used by router and registry tests: records dispatched
    /// requests into a shared log and answers with a canned result.
    pub struct MockStack {
        base: StackBase,
        log: Arc<Mutex<Vec<(Packet, Option<Recipient>)>>>,
        result: fn(&Packet, Option<Recipient>) -> DispatchResult,
    }

    impl MockStack {
        pub fn new(name: &str) -> Self {
            Self {
                base: StackBase::new(name),
                log: Arc::new(Mutex::new(Vec::new())),
                result: |request, recipient| {
                    // default transport rule: directed requests need a route
                    if request.header.uid != 0 && recipient.is_none() {
                        DispatchResult::Dropped
                    } else {
                        DispatchResult::Accepted
                    }
                },
            }
        }

        pub fn with_uid(mut self, uid: u32) -> Self {
            self.base.recipients.add(uid, Recipient::default());
            self
        }

        /// Keep a handle before boxing the stack into the registry.
        pub fn log_handle(&self) -> Arc<Mutex<Vec<(Packet, Option<Recipient>)>>> {
            Arc::clone(&self.log)
        }
    }

    impl Stack for MockStack {
        fn base(&self) -> &StackBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut StackBase {
            &mut self.base
        }

        fn dispatch(&mut self, request: &Packet, recipient: Option<Recipient>) -> DispatchResult {
            self.log
                .lock()
                .unwrap()
                .push((*request, recipient));
            (self.result)(request, recipient)
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_table_last_write_wins() {
        let mut table = RecipientTable::default();

        table.add(42, Recipient::from_address([1; 6]));
        table.add(42, Recipient::from_address([2; 6]));

        assert_eq!(table.len(), 1);
        assert_eq!(table.get(42), Some(Recipient::from_address([2; 6])));
    }

    #[test]
    fn add_if_missing_keeps_existing_route() {
        let mut table = RecipientTable::default();

        table.add(42, Recipient::from_address([7; 6]));
        table.add_if_missing(42);
        table.add_if_missing(43);

        assert_eq!(table.get(42), Some(Recipient::from_address([7; 6])));
        assert_eq!(table.get(43), Some(Recipient::default()));
    }

    #[test]
    fn remove_reports_presence() {
        let mut table = RecipientTable::default();

        table.add_if_missing(1);
        assert!(table.remove(1));
        assert!(!table.remove(1));
        assert!(table.is_empty());
    }
}
