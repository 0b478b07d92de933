//! Reference implementations of the three participant contracts.
//!
//! Each service here honors exactly the obligations the saga protocol
//! declares: the commands it consumes, the events it emits, and nothing
//! else. None of them embeds saga state; the coordinator is authoritative.
//! The stores behind them (partner master data, the contract store) stay
//! out of scope behind small ports.

pub mod alliances;
pub mod compliance;
pub mod integrations;

pub use alliances::{
    AlliancesService, ContractAnnotator, ContractDraft, ContractFactory, FixedContractFactory,
    LoggingContractAnnotator,
};
pub use compliance::ComplianceService;
pub use integrations::{IntegrationsService, PartnerProvisioner, UuidPartnerProvisioner};
