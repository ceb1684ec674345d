use std::sync::{Arc, Weak};

use log::trace;

use crate::sdbus::{SdBusInterface, SlotId};

/// Owns one pending async call or match registration. Dropping the slot
/// cancels the call or removes the match.
pub struct Slot {
    id: SlotId,
    intf: Weak<dyn SdBusInterface>,
    floating: bool,
}

impl Slot {
    pub(crate) fn new(intf: &Arc<dyn SdBusInterface>, id: SlotId) -> Self {
        Self {
            id,
            intf: Arc::downgrade(intf),
            floating: false,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Leaves the registration in place for the lifetime of the bus.
    pub fn detach(mut self) {
        self.floating = true;
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.floating {
            return;
        }
        if let Some(intf) = self.intf.upgrade() {
            trace!("releasing slot {:?}", self.id);
            intf.slot_unref(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::SdBusMock;
    use test_log::test;

    #[test]
    fn drop_releases_and_detach_does_not() {
        let mut mock = SdBusMock::new();
        mock.expect_slot_unref()
            .withf(|id| *id == SlotId(1))
            .times(1)
            .returning(|_| ());
        let intf: Arc<dyn SdBusInterface> = Arc::new(mock);
        drop(Slot::new(&intf, SlotId(1)));
        Slot::new(&intf, SlotId(2)).detach();
    }

    #[test]
    fn slot_outliving_bus_is_inert() {
        let mut mock = SdBusMock::new();
        mock.expect_slot_unref().never();
        let intf: Arc<dyn SdBusInterface> = Arc::new(mock);
        let slot = Slot::new(&intf, SlotId(3));
        drop(intf);
        drop(slot);
    }
}
