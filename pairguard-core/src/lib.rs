pub mod types;
pub mod error;
pub mod geometry;
pub mod zones;
pub mod config;
pub mod store;

pub use error::{Error, Result};
pub use types::{
    BoundingBox, ChannelStatus, ComponentKind, Detection, Frame, MachineId, ObjectClass,
    PairCounts, PairVerdict, Point, RelayChannel,
};
pub use geometry::Zone;
pub use zones::{boundary_key, BoundaryKeys, BoundaryMap, PairZones, ZoneSet};
pub use config::{
    CameraConfig, ClassBinding, ClassConfig, MachineConfig, MachineValidation, OverflowPolicy,
    RelayConfig, RelayDeviceConfig, SchedulerConfig, SystemConfig,
};
pub use store::ConfigStore;
