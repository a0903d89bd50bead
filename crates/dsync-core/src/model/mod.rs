// ── Apartment model ──
//
// Arena-style object graph: the `Apartment` owns every record and
// records refer to one another by id.

pub mod apartment;
pub mod cluster;
pub mod device;
pub mod ids;
pub mod node;
pub mod zone;

pub use apartment::Apartment;
pub use cluster::{Cluster, ClusterSource, SHADING_STANDARD_GROUP};
pub use device::{
    BinaryInput, ButtonConfig, CardinalDirection, Device, DeviceSensor, ShadingAttributes,
    WindProtectionClass, binary_input_count,
};
pub use ids::{Dsuid, GroupId, GroupMask, ParseDsuidError, ZoneId};
pub use node::{BusNode, MemberType, NodeCapabilities, NodeDigest};
pub use zone::{Group, HeatingConfig, SensorReading, Zone, ZoneHeating};
