//! Replicated domain objects.

pub mod global_control;
pub mod knob;
pub mod machine;
pub mod sample_bank;
pub mod sequencer;

use crate::object::{ClientFactory, FactoryRegistry};

pub use global_control::{GlobalControlListener, GlobalControlObject, GlobalControlReplica, TransportCommand};
pub use knob::{KnobHandle, KnobState};
pub use machine::{MachineCommand, MachineReplica, MachineStateListener, RIMachine};
pub use sample_bank::{SampleBankCommand, SampleBankListener, SampleBankObject, SampleBankReplica, SampleBankState};

pub const GLOBAL_CONTROL: &str = "GlobalControlObject";
pub const RI_MACHINE: &str = "RIMachine";
pub const SAMPLE_BANK: &str = "SampleBank";

/// Client factories for every built-in object type.
pub fn default_registry() -> FactoryRegistry {
    let mut registry = FactoryRegistry::new();
    registry
        .register(ClientFactory {
            type_name: GLOBAL_CONTROL,
            create: GlobalControlReplica::create,
        })
        .register(ClientFactory {
            type_name: RI_MACHINE,
            create: MachineReplica::create,
        })
        .register(ClientFactory {
            type_name: SAMPLE_BANK,
            create: SampleBankReplica::create,
        });
    registry
}
