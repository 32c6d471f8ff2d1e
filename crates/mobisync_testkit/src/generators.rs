//! Property-based test generators using proptest.
//!
//! Provides strategies for entity types, payloads, device ids and sequences
//! of device operations against one entity.

use mobisync_protocol::EntityType;
use proptest::prelude::*;
use serde_json::{Map, Value};

/// Strategy for generating entity types.
pub fn entity_type_strategy() -> impl Strategy<Value = EntityType> {
    prop::sample::select(EntityType::ALL.to_vec())
}

/// Strategy for generating valid device ids.
pub fn device_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9-]{0,15}").expect("Invalid regex")
}

/// Strategy for generating scalar JSON values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        prop::string::string_regex("[a-zA-Z0-9 ]{0,16}")
            .expect("Invalid regex")
            .prop_map(Value::String),
    ]
}

/// Strategy for generating flat JSON object payloads.
pub fn payload_strategy() -> impl Strategy<Value = Value> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex"),
        scalar_strategy(),
        0..6,
    )
    .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<String, Value>>()))
}

/// One step a device may take against a shared entity.
#[derive(Debug, Clone)]
pub enum DeviceOp {
    /// Device `device` pushes an update based on the version it last saw.
    Update {
        /// Index of the acting device.
        device: usize,
        /// Payload to push.
        data: Value,
    },
    /// Device `device` pulls and learns the current version.
    Refresh {
        /// Index of the acting device.
        device: usize,
    },
    /// Device `device` retransmits its previous push unchanged.
    Retry {
        /// Index of the acting device.
        device: usize,
    },
}

/// Strategy for generating interleaved operations of `devices` devices.
pub fn device_ops_strategy(devices: usize, max_len: usize) -> impl Strategy<Value = Vec<DeviceOp>> {
    let devices = devices.max(1);
    let op = prop_oneof![
        3 => (0..devices, payload_strategy()).prop_map(|(device, data)| DeviceOp::Update { device, data }),
        2 => (0..devices).prop_map(|device| DeviceOp::Refresh { device }),
        1 => (0..devices).prop_map(|device| DeviceOp::Retry { device }),
    ];
    prop::collection::vec(op, 1..=max_len.max(1))
}
