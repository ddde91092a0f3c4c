//! In-RAM pinUvAuthToken state: permissions, freshness flags and the polled
//! usage timers. Lost on power-off.
//!
//! The machine has two states. Idle: not in use, no timer, no permissions,
//! no cached storage key. InUse: entered by [`PinUvAuthTokenState::begin_using`],
//! left by timeout in [`PinUvAuthTokenState::observe`] or by
//! [`PinUvAuthTokenState::stop_using`]. The host polls `observe` with the
//! current clock before each use of the token; deltas use wrapping
//! arithmetic so the u32 millisecond clock may roll over mid-session.

use bitflags::bitflags;

use crate::error::Error;
use crate::state::StorageKey;

bitflags! {
    /// Permissions carried by an issued pinUvAuthToken.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u8 {
        const MAKE_CREDENTIAL = 0x01;
        const GET_ASSERTION = 0x02;
        const CREDENTIAL_MANAGEMENT = 0x04;
        const BIO_ENROLLMENT = 0x08;
        const LARGE_BLOB_WRITE = 0x10;
        const AUTHENTICATOR_CONFIGURATION = 0x20;
    }
}

/// Grace period for the first authenticated use of a fresh token.
pub const INITIAL_USAGE_TIME_LIMIT_MS: u32 = 19_000;

/// How long the user-present flag survives after token issuance.
pub const USER_PRESENT_TIME_LIMIT_MS: u32 = 19_000;

/// Hard lifetime cap for a token that has seen use.
pub const MAX_USAGE_TIME_PERIOD_MS: u32 = 600_000;

/// Upper bound on the relying-party id a token may be bound to.
pub const MAX_RP_ID_LENGTH: usize = 128;

const DEFAULT_RETRIES: u8 = 8;

/// The time-bounded "in-use" state of the pinUvAuthToken.
pub struct PinUvAuthTokenState {
    in_use: bool,
    permissions: Permissions,
    rp_id: Option<String>,
    user_present: bool,
    user_verified: bool,
    initial_usage_time_limit: u32,
    user_present_time_limit: u32,
    max_usage_time_period: u32,
    usage_timer: Option<u32>,
    used: bool,
    pin_key: Option<StorageKey>,
    pin_retries: u8,
    uv_retries: u8,
}

impl Default for PinUvAuthTokenState {
    fn default() -> Self {
        Self {
            in_use: false,
            permissions: Permissions::empty(),
            rp_id: None,
            user_present: false,
            user_verified: false,
            initial_usage_time_limit: INITIAL_USAGE_TIME_LIMIT_MS,
            user_present_time_limit: USER_PRESENT_TIME_LIMIT_MS,
            max_usage_time_period: MAX_USAGE_TIME_PERIOD_MS,
            usage_timer: None,
            used: false,
            pin_key: None,
            pin_retries: DEFAULT_RETRIES,
            uv_retries: DEFAULT_RETRIES,
        }
    }
}

impl PinUvAuthTokenState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts the token in use at `now_ms`, caching the storage key of the
    /// session that authorized it. Taking the key here keeps
    /// `in_use == usage_timer.is_some() == pin_key.is_some()` true by
    /// construction.
    pub fn begin_using(&mut self, user_is_present: bool, now_ms: u32, pin_key: StorageKey) {
        self.user_present = user_is_present;
        self.user_verified = true;
        self.initial_usage_time_limit = INITIAL_USAGE_TIME_LIMIT_MS;
        self.user_present_time_limit = USER_PRESENT_TIME_LIMIT_MS;
        self.usage_timer = Some(now_ms);
        self.pin_key = Some(pin_key);
        self.in_use = true;
    }

    /// Polled timer observer; a no-op while idle.
    ///
    /// Drops the user-present flag once its window passes, and expires the
    /// token entirely when a fresh token outlives its initial-use window or
    /// any token outlives the maximum usage period.
    pub fn observe(&mut self, now_ms: u32) {
        let Some(start) = self.usage_timer else {
            return;
        };
        let delta = now_ms.wrapping_sub(start);

        if delta > self.user_present_time_limit {
            self.user_present = false;
        }
        if (delta > self.initial_usage_time_limit && !self.used)
            || delta > self.max_usage_time_period
        {
            self.expire();
        }
    }

    /// Records the first successful authenticated operation, extending the
    /// token's life to the maximum usage period.
    pub fn mark_used(&mut self) {
        if self.in_use {
            self.used = true;
        }
    }

    /// Keeps only the largeBlobWrite bit.
    pub fn clear_permissions_except_lbw(&mut self) {
        self.permissions &= Permissions::LARGE_BLOB_WRITE;
    }

    /// Unconditional transition to Idle; also drops the relying-party
    /// binding and restores the maximum usage period.
    pub fn stop_using(&mut self) {
        self.expire();
        self.rp_id = None;
        self.max_usage_time_period = MAX_USAGE_TIME_PERIOD_MS;
    }

    fn expire(&mut self) {
        self.in_use = false;
        self.permissions = Permissions::empty();
        self.user_present = false;
        self.user_verified = false;
        self.usage_timer = None;
        self.used = false;
        self.pin_key = None;
        self.initial_usage_time_limit = INITIAL_USAGE_TIME_LIMIT_MS;
        self.user_present_time_limit = USER_PRESENT_TIME_LIMIT_MS;
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    /// True only while the token is in use and user verification holds.
    pub fn get_user_verified_flag(&self) -> bool {
        self.in_use && self.user_verified
    }

    /// True only while the token is in use and inside the presence window.
    pub fn get_user_present_flag(&self) -> bool {
        self.in_use && self.user_present
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Assigns token permissions; meaningful only while in use.
    pub fn set_permissions(&mut self, permissions: Permissions) {
        self.permissions = permissions;
    }

    pub fn has_permission(&self, permission: Permissions) -> bool {
        self.permissions.contains(permission)
    }

    pub fn rp_id(&self) -> Option<&str> {
        self.rp_id.as_deref()
    }

    /// Binds the token to a relying party. Ids longer than
    /// [`MAX_RP_ID_LENGTH`] bytes are refused rather than truncated, since a
    /// prefix of an id names a different relying party.
    pub fn set_rp_id(&mut self, rp_id: &str) -> Result<(), Error> {
        if rp_id.len() > MAX_RP_ID_LENGTH {
            return Err(Error::InvalidLength);
        }
        self.rp_id = Some(rp_id.to_string());
        Ok(())
    }

    /// The storage key cached for the session, present exactly while in use.
    pub fn pin_key(&self) -> Option<&StorageKey> {
        self.pin_key.as_ref()
    }

    pub fn pin_retries(&self) -> u8 {
        self.pin_retries
    }

    pub fn set_pin_retries(&mut self, retries: u8) {
        self.pin_retries = retries;
    }

    pub fn uv_retries(&self) -> u8 {
        self.uv_retries
    }

    pub fn set_uv_retries(&mut self, retries: u8) {
        self.uv_retries = retries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> StorageKey {
        StorageKey([0x4Bu8; 32])
    }

    fn assert_idle(state: &PinUvAuthTokenState) {
        assert!(!state.is_in_use());
        assert!(state.pin_key().is_none());
        assert!(state.usage_timer.is_none());
        assert_eq!(state.permissions(), Permissions::empty());
        assert!(!state.get_user_verified_flag());
        assert!(!state.get_user_present_flag());
    }

    #[test]
    fn starts_idle() {
        let state = PinUvAuthTokenState::new();
        assert_idle(&state);
        assert_eq!(state.pin_retries(), 8);
        assert_eq!(state.uv_retries(), 8);
    }

    #[test]
    fn begin_using_sets_flags_and_key() {
        let mut state = PinUvAuthTokenState::new();
        state.begin_using(true, 0, test_key());
        assert!(state.is_in_use());
        assert!(state.get_user_verified_flag());
        assert!(state.get_user_present_flag());
        assert!(state.pin_key().is_some());
    }

    #[test]
    fn fresh_token_expires_after_initial_window() {
        let mut state = PinUvAuthTokenState::new();
        state.begin_using(true, 0, test_key());
        state.observe(19_000);
        assert!(state.is_in_use());
        state.observe(19_001);
        assert_idle(&state);
    }

    #[test]
    fn observed_timeout_vector() {
        let mut state = PinUvAuthTokenState::new();
        state.begin_using(true, 1_000, test_key());
        state.observe(15_000);
        assert!(state.is_in_use());
        assert!(state.get_user_present_flag());
        state.observe(20_001);
        assert_idle(&state);
    }

    #[test]
    fn used_token_sheds_presence_but_survives_to_max_period() {
        let mut state = PinUvAuthTokenState::new();
        state.begin_using(true, 0, test_key());
        state.mark_used();

        state.observe(19_001);
        assert!(state.is_in_use());
        assert!(!state.get_user_present_flag());
        assert!(state.get_user_verified_flag());

        state.observe(600_000);
        assert!(state.is_in_use());
        state.observe(600_001);
        assert_idle(&state);
    }

    #[test]
    fn observe_handles_clock_wraparound() {
        let mut state = PinUvAuthTokenState::new();
        // The timer starts just before the u32 clock rolls over.
        state.begin_using(true, u32::MAX - 500, test_key());
        state.mark_used();

        state.observe(18_000); // delta = 18_501
        assert!(state.is_in_use());
        assert!(state.get_user_present_flag());

        state.observe(19_000); // delta = 19_501
        assert!(state.is_in_use());
        assert!(!state.get_user_present_flag());

        state.observe(599_499); // delta = 600_000
        assert!(state.is_in_use());
        state.observe(599_500); // delta = 600_001
        assert_idle(&state);
    }

    #[test]
    fn permissions_mask_keeps_only_lbw() {
        let mut state = PinUvAuthTokenState::new();
        state.begin_using(true, 0, test_key());
        state.set_permissions(Permissions::from_bits_retain(0xFF));
        state.clear_permissions_except_lbw();
        assert_eq!(state.permissions().bits(), 0x10);
        assert!(state.has_permission(Permissions::LARGE_BLOB_WRITE));
        assert!(!state.has_permission(Permissions::GET_ASSERTION));
    }

    #[test]
    fn stop_using_clears_rp_binding() {
        let mut state = PinUvAuthTokenState::new();
        state.begin_using(false, 42, test_key());
        state.set_permissions(Permissions::GET_ASSERTION);
        state.set_rp_id("example.com").unwrap();
        assert_eq!(state.rp_id(), Some("example.com"));
        assert!(!state.get_user_present_flag());
        assert!(state.get_user_verified_flag());

        state.stop_using();
        assert_idle(&state);
        assert_eq!(state.rp_id(), None);
    }

    #[test]
    fn expiry_keeps_rp_binding_until_stop() {
        let mut state = PinUvAuthTokenState::new();
        state.begin_using(true, 0, test_key());
        state.set_rp_id("example.com").unwrap();
        state.observe(19_001);
        assert_idle(&state);
        assert_eq!(state.rp_id(), Some("example.com"));
    }

    #[test]
    fn long_rp_ids_are_refused() {
        let mut state = PinUvAuthTokenState::new();
        let long = "a".repeat(MAX_RP_ID_LENGTH + 1);
        assert_eq!(state.set_rp_id(&long), Err(Error::InvalidLength));
        assert_eq!(state.rp_id(), None);
        state.set_rp_id(&"a".repeat(MAX_RP_ID_LENGTH)).unwrap();
        assert!(state.rp_id().is_some());
    }
}
