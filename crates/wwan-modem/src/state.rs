//! Cached modem state, refreshed by explicit polls.
//!
//! Every `update_*` method returns `true` only when the value differs from
//! the cached one, so callers can push notifications on edges rather than on
//! every poll.

use crate::error::ModemError;
use crate::protocol::Modem;
use crate::transport::Transport;
use crate::types::{RadioTechnology, RegistrationStatus, RequestedMode, SignalLevel, StatusSnapshot};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModemState {
    signal: SignalLevel,
    /// `None` while searching.
    network: Option<String>,
    technology: RadioTechnology,
    registration: RegistrationStatus,
}

impl ModemState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> SignalLevel {
        self.signal
    }

    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    pub fn technology(&self) -> RadioTechnology {
        self.technology
    }

    pub fn registration(&self) -> RegistrationStatus {
        self.registration
    }

    // ─── Setters (edge-detecting) ───────────────────────────────────────

    pub fn set_signal(&mut self, signal: SignalLevel) -> bool {
        replace_if_changed(&mut self.signal, signal)
    }

    pub fn set_network(&mut self, network: Option<String>) -> bool {
        replace_if_changed(&mut self.network, network)
    }

    pub fn set_technology(&mut self, technology: RadioTechnology) -> bool {
        replace_if_changed(&mut self.technology, technology)
    }

    pub fn set_registration(&mut self, registration: RegistrationStatus) -> bool {
        replace_if_changed(&mut self.registration, registration)
    }

    /// Forget everything; used when the device disappears.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    // ─── Polls ──────────────────────────────────────────────────────────

    /// A missing `+CIND` reading counts as zero bars.
    pub async fn update_signal<T: Transport>(&mut self, modem: &Modem<T>) -> Result<bool, ModemError> {
        let level = modem.signal_level().await?.unwrap_or_default();
        Ok(self.set_signal(level))
    }

    pub async fn update_network<T: Transport>(
        &mut self,
        modem: &Modem<T>,
    ) -> Result<bool, ModemError> {
        let lines = modem.execute("AT+COPS?").await?;
        let name = lines.iter().find_map(|l| parse_operator_name(l));
        Ok(self.set_network(name))
    }

    pub async fn update_type<T: Transport>(&mut self, modem: &Modem<T>) -> Result<bool, ModemError> {
        let technology = modem.acquired_technology().await?;
        Ok(self.set_technology(technology))
    }

    pub async fn update_registration<T: Transport>(
        &mut self,
        modem: &Modem<T>,
    ) -> Result<bool, ModemError> {
        let registration = modem.registration().await?.unwrap_or_default();
        Ok(self.set_registration(registration))
    }

    pub fn snapshot(&self, radio: RequestedMode) -> StatusSnapshot {
        StatusSnapshot {
            radio,
            network: self.network.clone(),
            technology: self.technology,
            signal: self.signal,
        }
    }
}

fn replace_if_changed<V: PartialEq>(slot: &mut V, value: V) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

/// Operator name from a `+COPS:` line: the text between the first pair of
/// quotes, which must be non-empty.
///
/// ```
/// use wwan_modem::state::parse_operator_name;
///
/// assert_eq!(
///     parse_operator_name(r#"+COPS: 0,0,"T-Mobile D",2"#).as_deref(),
///     Some("T-Mobile D")
/// );
/// assert_eq!(parse_operator_name("+COPS: 0"), None);
/// ```
pub fn parse_operator_name(line: &str) -> Option<String> {
    let rest = line.strip_prefix("+COPS:")?;
    let open = rest.find('"')?;
    let after_open = &rest[open + 1..];
    let close = after_open.find('"')?;
    if close == 0 {
        return None;
    }
    Some(after_open[..close].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_report_edges() {
        let mut state = ModemState::new();
        assert!(state.set_signal(SignalLevel::new(3)));
        assert!(!state.set_signal(SignalLevel::new(3)));
        assert!(state.set_signal(SignalLevel::new(2)));

        assert!(!state.set_network(None), "initially searching");
        assert!(state.set_network(Some("Vodafone.de".into())));
        assert!(!state.set_network(Some("Vodafone.de".into())));
        assert!(state.set_network(None));

        assert!(state.set_technology(RadioTechnology::Umts));
        assert!(!state.set_technology(RadioTechnology::Umts));
    }

    #[test]
    fn reset_clears_everything() {
        let mut state = ModemState::new();
        state.set_signal(SignalLevel::new(4));
        state.set_network(Some("E-Plus".into()));
        state.set_technology(RadioTechnology::Edge);
        state.set_registration(RegistrationStatus::RegRoaming);
        state.reset();
        assert_eq!(state, ModemState::default());
    }

    #[test]
    fn operator_name_parsing() {
        assert_eq!(
            parse_operator_name("+COPS: 0,0,\"o2 - de\",2").as_deref(),
            Some("o2 - de")
        );
        assert_eq!(parse_operator_name("+COPS: 0,0,\"\",2"), None, "empty name");
        assert_eq!(parse_operator_name("+COPS: 0,0,\"unterminated"), None);
        assert_eq!(parse_operator_name("+CREG: 0,1"), None);
        assert_eq!(parse_operator_name("OK"), None);
    }

    #[test]
    fn snapshot_carries_radio() {
        let mut state = ModemState::new();
        state.set_network(Some("Telekom.de".into()));
        state.set_technology(RadioTechnology::Hspa);
        let snap = state.snapshot(RequestedMode::ForceUmts);
        assert_eq!(snap.radio, RequestedMode::ForceUmts);
        assert_eq!(snap.summary(), "Telekom.de (3G+)");
    }
}
