//! Frame identifier matching and the per-bus dispatch table

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use multican_common::CanMessage;
use snafu::Snafu;

use crate::device::Device;

/// An identifier/mask pair selecting inbound frames.
///
/// A matcher accepts frame identifier `x` when `(x & mask) == (identifier &
/// mask)`. Bits of the identifier corresponding to zeros in the mask are
/// ignored; an all-ones mask matches exactly one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameMatcher {
    /// The reference identifier
    pub identifier: u32,
    /// Bits of the identifier that participate in the comparison
    pub mask: u32,
}

impl FrameMatcher {
    /// A matcher accepting exactly `identifier`.
    pub fn exact(identifier: u32) -> Self {
        Self {
            identifier,
            mask: u32::MAX,
        }
    }

    /// A matcher accepting all identifiers equal to `identifier` on the bits
    /// set in `mask`.
    pub fn masked(identifier: u32, mask: u32) -> Self {
        Self { identifier, mask }
    }

    /// True if the matcher accepts the given frame identifier.
    pub fn matches(&self, id: u32) -> bool {
        id & self.mask == self.identifier & self.mask
    }

    fn is_exact(&self) -> bool {
        self.mask == u32::MAX
    }
}

/// Error returned when a callback registration is rejected
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RegisterError {
    /// A callback is already registered for this identifier/mask pair
    #[snafu(display(
        "duplicate registration for identifier 0x{:X} mask 0x{:X}",
        matcher.identifier,
        matcher.mask
    ))]
    DuplicateMatcher {
        /// The rejected matcher
        matcher: FrameMatcher,
    },
    /// The bus was already initialized; the dispatch table is frozen
    #[snafu(display("bus {bus} is already initialized"))]
    BusRunning {
        /// Name of the bus
        bus: String,
    },
    /// The device is already attached to a bus
    #[snafu(display("device {device} is already attached to a bus"))]
    DeviceAlreadyAttached {
        /// Name of the device
        device: String,
    },
}

/// A parse callback. Returns true if the frame was successfully parsed.
pub type ParseCallback = Box<dyn Fn(&CanMessage) -> bool + Send + Sync>;

struct DispatchEntry {
    /// Backlink for resetting the owning device's timeout counter on a
    /// successful parse; `None` for callbacks not tied to a device
    device: Option<Arc<dyn Device>>,
    callback: ParseCallback,
}

/// The per-bus dispatch table.
///
/// Built during device registration and frozen once the bus is initialized,
/// so lookups run lock-free on the receive thread.
pub(crate) struct Dispatcher {
    entries: HashMap<FrameMatcher, DispatchEntry>,
    /// Masked matchers in registration order; scanned when no exact match
    /// exists
    masked: Vec<FrameMatcher>,
    unmapped_callback: Option<ParseCallback>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            masked: Vec::new(),
            unmapped_callback: None,
        }
    }

    pub fn register(
        &mut self,
        matcher: FrameMatcher,
        device: Option<Arc<dyn Device>>,
        callback: ParseCallback,
    ) -> Result<(), RegisterError> {
        if self.entries.contains_key(&matcher) {
            return DuplicateMatcherSnafu { matcher }.fail();
        }
        if !matcher.is_exact() {
            self.masked.push(matcher);
        }
        self.entries.insert(matcher, DispatchEntry { device, callback });
        Ok(())
    }

    pub fn set_unmapped_callback(&mut self, callback: ParseCallback) {
        self.unmapped_callback = Some(callback);
    }

    /// Route a frame to at most one callback: an exact identifier match
    /// shadows masked matchers, and among masked hits the first registered
    /// wins. Falls through to the unmapped callback when nothing matches.
    pub fn dispatch(&self, msg: &CanMessage) -> bool {
        let entry = self
            .entries
            .get(&FrameMatcher::exact(msg.id()))
            .or_else(|| {
                self.masked
                    .iter()
                    .find(|m| m.matches(msg.id()))
                    .and_then(|m| self.entries.get(m))
            });

        match entry {
            Some(entry) => {
                let parsed = (entry.callback)(msg);
                if parsed {
                    if let Some(device) = &entry.device {
                        device.state().reset_timeout_counter();
                    }
                }
                parsed
            }
            None => match &self.unmapped_callback {
                Some(callback) => callback(msg),
                None => {
                    debug!("no callback registered for frame id 0x{:X}", msg.id());
                    true
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_matcher_matches_only_its_id() {
        let matcher = FrameMatcher::exact(0x181);
        assert!(matcher.matches(0x181));
        assert!(!matcher.matches(0x180));
        assert!(!matcher.matches(0x182));
        assert!(!matcher.matches(0x181 | 0x800));
    }

    #[test]
    fn test_masked_matcher() {
        // Match all frames of the form 0x..FA..33
        let matcher = FrameMatcher::masked(0x00FA_0033, 0x00FF_00FF);
        assert!(matcher.matches(0x00FA_0033));
        assert!(matcher.matches(0x12FA_5633));
        assert!(!matcher.matches(0x12FB_5633));
        assert!(!matcher.matches(0x12FA_5634));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register(FrameMatcher::exact(0x181), None, Box::new(|_| true))
            .unwrap();
        let result = dispatcher.register(FrameMatcher::exact(0x181), None, Box::new(|_| true));
        assert!(matches!(
            result,
            Err(RegisterError::DuplicateMatcher { .. })
        ));
    }
}
