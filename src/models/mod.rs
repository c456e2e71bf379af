pub mod metadata;
pub mod record;
pub mod sighting;

pub use metadata::{ResolvedMetadata, TRANSPORT_ONLY_RANK};
pub use record::Record;
pub use sighting::{DeviceAddress, Identity, Sighting, SightingBuilder, TransportData, TransportKind};
