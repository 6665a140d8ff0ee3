//! Common state shared by every logical unit.

use retroscsi_protocol::opcode;

/// Initiator id seen during selection; `None` when the initiator could not be
/// identified (single-bit selection by old host adapters).
pub type InitiatorId = Option<u8>;

/// Attributes and status flags common to all device kinds.
///
/// Concrete devices embed this value; shared command semantics operate on it
/// through free functions instead of a class hierarchy.
#[derive(Debug, Clone)]
pub struct DeviceState {
    lun: u8,
    vendor: String,
    product: String,
    revision: String,
    scsi_level: u8,

    // Pending sense for the next REQUEST SENSE
    sense: (u8, u8),

    ready: bool,
    reset: bool,
    attn: bool,
    read_only: bool,
    protectable: bool,
    protected: bool,
    stoppable: bool,
    stopped: bool,
    removable: bool,
    removed: bool,
    lockable: bool,
    locked: bool,
    supports_params: bool,
    supports_save_parameters: bool,

    // Reservation holder; the outer Option is "reserved at all"
    reservation: Option<InitiatorId>,
}

impl DeviceState {
    pub fn new(lun: u8, scsi_level: u8) -> Self {
        Self {
            lun,
            vendor: "RETRO".to_string(),
            product: String::new(),
            revision: "0100".to_string(),
            scsi_level,
            sense: (0, 0),
            ready: false,
            reset: false,
            attn: false,
            read_only: false,
            protectable: false,
            protected: false,
            stoppable: false,
            stopped: false,
            removable: false,
            removed: false,
            lockable: false,
            locked: false,
            supports_params: false,
            supports_save_parameters: false,
            reservation: None,
        }
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    // ========================================================================
    // Product data
    // ========================================================================

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// Set the INQUIRY vendor string. Must be 1..=8 bytes; violating the
    /// bounds is a programming error.
    pub fn set_vendor(&mut self, vendor: &str) {
        assert!(
            !vendor.is_empty() && vendor.len() <= 8,
            "vendor string must be 1..=8 bytes"
        );
        self.vendor = vendor.to_string();
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    /// Set the INQUIRY product string. Must be 1..=16 bytes. When `replace`
    /// is false an already configured product is kept (vital product data
    /// must not change once set).
    pub fn set_product(&mut self, product: &str, replace: bool) {
        assert!(
            !product.is_empty() && product.len() <= 16,
            "product string must be 1..=16 bytes"
        );
        if !replace && !self.product.is_empty() {
            return;
        }
        self.product = product.to_string();
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Set the INQUIRY revision string. Must be 1..=4 bytes.
    pub fn set_revision(&mut self, revision: &str) {
        assert!(
            !revision.is_empty() && revision.len() <= 4,
            "revision string must be 1..=4 bytes"
        );
        self.revision = revision.to_string();
    }

    /// Vendor, product and revision padded to their INQUIRY field widths
    pub fn padded_name(&self) -> String {
        format!(
            "{:<8}{:<16}{:<4}",
            self.vendor, self.product, self.revision
        )
    }

    pub fn scsi_level(&self) -> u8 {
        self.scsi_level
    }

    pub fn set_scsi_level(&mut self, level: u8) {
        self.scsi_level = level;
    }

    // ========================================================================
    // Sense
    // ========================================================================

    /// Pending `(sense_key, asc)` pair for the next REQUEST SENSE
    pub fn sense(&self) -> (u8, u8) {
        self.sense
    }

    pub fn set_sense(&mut self, sense_key: u8, asc: u8) {
        self.sense = (sense_key, asc);
    }

    pub fn clear_sense(&mut self) {
        self.sense = (0, 0);
    }

    pub fn has_sense(&self) -> bool {
        self.sense != (0, 0)
    }

    // ========================================================================
    // Status flags
    // ========================================================================

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn is_reset(&self) -> bool {
        self.reset
    }

    pub fn set_reset(&mut self, reset: bool) {
        self.reset = reset;
    }

    pub fn is_attn(&self) -> bool {
        self.attn
    }

    pub fn set_attn(&mut self, attn: bool) {
        self.attn = attn;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn is_protectable(&self) -> bool {
        self.protectable
    }

    pub fn set_protectable(&mut self, protectable: bool) {
        self.protectable = protectable;
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Software write protection; only possible on protectable devices whose
    /// medium is not read-only.
    pub fn set_protected(&mut self, protected: bool) {
        if protected && (!self.protectable || self.read_only) {
            return;
        }
        self.protected = protected;
    }

    pub fn is_stoppable(&self) -> bool {
        self.stoppable
    }

    pub fn set_stoppable(&mut self, stoppable: bool) {
        self.stoppable = stoppable;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn set_stopped(&mut self, stopped: bool) {
        self.stopped = stopped;
    }

    pub fn is_removable(&self) -> bool {
        self.removable
    }

    pub fn set_removable(&mut self, removable: bool) {
        self.removable = removable;
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn set_removed(&mut self, removed: bool) {
        self.removed = removed;
    }

    pub fn is_lockable(&self) -> bool {
        self.lockable
    }

    pub fn set_lockable(&mut self, lockable: bool) {
        self.lockable = lockable;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn supports_params(&self) -> bool {
        self.supports_params
    }

    pub fn set_supports_params(&mut self, supports: bool) {
        self.supports_params = supports;
    }

    /// Whether MODE SELECT may carry the save-parameters bit
    pub fn supports_save_parameters(&self) -> bool {
        self.supports_save_parameters
    }

    pub fn set_supports_save_parameters(&mut self, supports: bool) {
        self.supports_save_parameters = supports;
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Reset after a bus reset or BUS DEVICE RESET message
    pub fn reset(&mut self) {
        self.locked = false;
        self.attn = false;
        self.reset = false;
        self.reservation = None;
    }

    /// Spin up. Fails when the unit is not ready.
    pub fn start(&mut self) -> bool {
        if !self.ready {
            return false;
        }
        self.stopped = false;
        true
    }

    /// Spin down
    pub fn stop(&mut self) {
        self.ready = false;
        self.attn = false;
        self.stopped = true;
    }

    /// Eject the medium. Requires `ready ∧ removable ∧ ¬locked`; `force`
    /// ignores the lock.
    pub fn eject(&mut self, force: bool) -> bool {
        if !self.ready || !self.removable {
            return false;
        }
        if !force && self.locked {
            return false;
        }
        self.ready = false;
        self.attn = false;
        self.removed = true;
        self.locked = false;
        self.stopped = true;
        true
    }

    // ========================================================================
    // Reservation
    // ========================================================================

    pub fn reserve(&mut self, initiator: InitiatorId) {
        self.reservation = Some(initiator);
    }

    pub fn release(&mut self) {
        self.reservation = None;
    }

    pub fn discard_reservation(&mut self) {
        self.reservation = None;
    }

    /// Whether `initiator` may execute `cdb` despite any reservation.
    ///
    /// While reserved by another initiator only INQUIRY, REQUEST SENSE,
    /// RELEASE and PREVENT/ALLOW MEDIUM REMOVAL with the prevent bit clear
    /// are allowed. The prevent bit is only meaningful for PREVENT/ALLOW, so
    /// the probe is guarded on that opcode.
    pub fn check_reservation(&self, initiator: InitiatorId, cdb: &[u8]) -> bool {
        let Some(holder) = self.reservation else {
            return true;
        };
        if holder == initiator {
            return true;
        }
        match cdb[0] {
            opcode::INQUIRY | opcode::REQUEST_SENSE | opcode::RELEASE_6 => true,
            opcode::PREVENT_ALLOW_MEDIUM_REMOVAL => cdb[4] & 0x01 == 0,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cdb(op: u8) -> [u8; 6] {
        let mut cdb = [0u8; 6];
        cdb[0] = op;
        cdb
    }

    #[test]
    fn test_protection_rules() {
        let mut state = DeviceState::new(0, retroscsi_protocol::scsi_level::SCSI_2);

        state.set_protected(true);
        assert!(!state.is_protected(), "not protectable");

        state.set_protectable(true);
        state.set_protected(true);
        assert!(state.is_protected());
        state.set_protected(false);
        assert!(!state.is_protected());

        state.set_protectable(false);
        state.set_read_only(true);
        state.set_protected(true);
        assert!(!state.is_protected(), "read-only media are not protectable");
        state.set_read_only(false);
        state.set_protected(true);
        assert!(!state.is_protected());
    }

    #[test]
    #[should_panic]
    fn test_vendor_too_long_is_rejected() {
        let mut state = DeviceState::new(0, 2);
        state.set_vendor("123456789");
    }

    #[test]
    fn test_product_is_vital_product_data() {
        let mut state = DeviceState::new(0, 2);
        state.set_product("1234567890123456", true);
        state.set_product("xyz", false);
        assert_eq!("1234567890123456", state.product());
    }

    #[test]
    fn test_padded_name() {
        let mut state = DeviceState::new(0, 2);
        state.set_vendor("V");
        state.set_product("P", true);
        state.set_revision("R");
        assert_eq!("V       P               R   ", state.padded_name());
    }

    #[test]
    fn test_reset_clears_lock_attn_reset() {
        let mut state = DeviceState::new(0, 2);
        state.set_locked(true);
        state.set_attn(true);
        state.set_reset(true);
        state.reset();
        assert!(!state.is_locked());
        assert!(!state.is_attn());
        assert!(!state.is_reset());
    }

    #[test]
    fn test_start_requires_ready() {
        let mut state = DeviceState::new(0, 2);
        state.set_stopped(true);
        state.set_ready(false);
        assert!(!state.start());
        assert!(state.is_stopped());
        state.set_ready(true);
        assert!(state.start());
        assert!(!state.is_stopped());
    }

    #[test]
    fn test_stop() {
        let mut state = DeviceState::new(0, 2);
        state.set_ready(true);
        state.set_attn(true);
        state.set_stopped(false);
        state.stop();
        assert!(!state.is_ready());
        assert!(!state.is_attn());
        assert!(state.is_stopped());
    }

    #[test]
    fn test_eject() {
        let mut state = DeviceState::new(0, 2);

        state.set_ready(false);
        state.set_removable(false);
        assert!(!state.eject(false));

        state.set_ready(true);
        assert!(!state.eject(false), "not removable");

        state.set_removable(true);
        state.set_locked(true);
        assert!(!state.eject(false), "locked");
        assert!(state.eject(true), "force ignores the lock");

        state.set_ready(true);
        state.set_locked(false);
        assert!(state.eject(false));
        assert!(!state.is_ready());
        assert!(!state.is_attn());
        assert!(state.is_removed());
        assert!(!state.is_locked());
        assert!(state.is_stopped());
    }

    #[test]
    fn test_check_reservation() {
        let mut state = DeviceState::new(0, 2);

        assert!(state.check_reservation(Some(0), &cdb(opcode::TEST_UNIT_READY)));

        state.reserve(Some(0));
        assert!(state.check_reservation(Some(0), &cdb(opcode::TEST_UNIT_READY)));
        assert!(!state.check_reservation(Some(1), &cdb(opcode::TEST_UNIT_READY)));
        assert!(!state.check_reservation(None, &cdb(opcode::TEST_UNIT_READY)));
        assert!(state.check_reservation(Some(1), &cdb(opcode::INQUIRY)));
        assert!(state.check_reservation(Some(1), &cdb(opcode::REQUEST_SENSE)));
        assert!(state.check_reservation(Some(1), &cdb(opcode::RELEASE_6)));

        let mut prevent = cdb(opcode::PREVENT_ALLOW_MEDIUM_REMOVAL);
        assert!(state.check_reservation(Some(1), &prevent));
        prevent[4] = 0x01;
        assert!(!state.check_reservation(Some(1), &prevent));

        // The prevent-bit probe only applies to PREVENT/ALLOW itself
        let mut other = cdb(opcode::TEST_UNIT_READY);
        other[4] = 0x01;
        assert!(!state.check_reservation(Some(1), &other));
    }

    #[test]
    fn test_reservation_by_unknown_initiator() {
        let mut state = DeviceState::new(0, 2);
        state.reserve(None);
        assert!(!state.check_reservation(Some(1), &cdb(opcode::TEST_UNIT_READY)));
        assert!(state.check_reservation(None, &cdb(opcode::TEST_UNIT_READY)));
        state.release();
        assert!(state.check_reservation(Some(1), &cdb(opcode::TEST_UNIT_READY)));
    }
}
