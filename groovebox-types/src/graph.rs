use crate::knob::KnobValue;
use crate::machine::Connection;

/// The authoritative audio graph the server mirrors.
///
/// Implementations apply topology and controller changes to the real
/// machines. Errors are human-readable reasons sent back to the requester.
pub trait MachineGraph: Send + Sync {
    fn connect(&self, connection: &Connection) -> Result<(), String>;
    fn disconnect(&self, connection: &Connection) -> Result<(), String>;
    /// Apply a controller value and return the value actually in effect.
    fn set_controller(
        &self,
        machine: &str,
        controller: &str,
        value: &KnobValue,
    ) -> Result<KnobValue, String>;
}
