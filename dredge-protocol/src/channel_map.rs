//! Channel maps: named telemetry channels to analog array offsets.

use crate::error::{ChannelMapError, ProtocolError};
use std::collections::BTreeMap;

/// Name of the built-in vessel profile.
pub const DEFAULT_PROFILE: &str = "hua_an_long";

/// Protocol index of the first analog point on the built-in profile.
pub const DEFAULT_BASE_INDEX: u32 = 327;

/// Field names every relayed sample already carries.
pub const RESERVED_CHANNEL_NAMES: [&str; 2] = ["type", "timestamp"];

/// Immutable mapping from channel name to zero-based analog offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    channels: BTreeMap<String, usize>,
    required_points: usize,
}

impl ChannelMap {
    /// Builds a map from zero-based offsets.
    pub fn new<I, S>(offsets: I) -> Result<Self, ChannelMapError>
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let mut channels = BTreeMap::new();
        for (name, offset) in offsets {
            let name = name.into();
            if name.trim().is_empty() {
                return Err(ChannelMapError::EmptyName);
            }
            if RESERVED_CHANNEL_NAMES.contains(&name.as_str()) {
                return Err(ChannelMapError::ReservedName(name));
            }
            if channels.contains_key(&name) {
                return Err(ChannelMapError::DuplicateName(name));
            }
            channels.insert(name, offset);
        }

        let required_points = match channels.values().max() {
            Some(max) => max + 1,
            None => return Err(ChannelMapError::Empty),
        };

        Ok(Self {
            channels,
            required_points,
        })
    }

    /// Builds a map from protocol-assigned absolute indices.
    ///
    /// Each offset is the absolute index minus `base_index`.
    pub fn from_absolute<I, S>(base_index: u32, indices: I) -> Result<Self, ChannelMapError>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let mut offsets = Vec::new();
        for (name, index) in indices {
            let name = name.into();
            if index < base_index {
                return Err(ChannelMapError::IndexBelowBase {
                    name,
                    index,
                    base: base_index,
                });
            }
            offsets.push((name, (index - base_index) as usize));
        }
        Self::new(offsets)
    }

    /// The built-in channel table of the cutter-suction dredger profile.
    pub fn dredger_default() -> Self {
        Self::from_absolute(
            DEFAULT_BASE_INDEX,
            DEFAULT_CHANNELS.iter().map(|(name, index)| (*name, *index)),
        )
        .expect("built-in channel table is valid")
    }

    /// Returns the offset of a channel.
    pub fn get(&self, name: &str) -> Option<usize> {
        self.channels.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Iterates channels in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.channels.iter().map(|(name, offset)| (name.as_str(), *offset))
    }

    /// Number of analog points a frame must carry for every channel to resolve.
    pub fn required_points(&self) -> usize {
        self.required_points
    }

    /// Resolves every channel against an analog array.
    pub fn apply(&self, analog: &[f32]) -> Result<BTreeMap<String, f32>, ProtocolError> {
        if analog.len() < self.required_points {
            return Err(ProtocolError::InsufficientChannels {
                available: analog.len(),
                required: self.required_points,
            });
        }
        Ok(self
            .channels
            .iter()
            .map(|(name, offset)| (name.clone(), analog[*offset]))
            .collect())
    }
}

/// Absolute protocol indices of the built-in profile.
const DEFAULT_CHANNELS: &[(&str, u32)] = &[
    ("left_ear_draft", 327),
    ("underwater_pump_suction_seal_pressure", 328),
    ("underwater_pump_shaft_seal_pressure", 329),
    ("mud_pump_1_shaft_seal_pressure", 330),
    ("mud_pump_1_suction_seal_pressure", 331),
    ("mud_pump_2_suction_seal_pressure", 332),
    ("mud_pump_2_shaft_seal_pressure", 333),
    ("right_ear_draft", 334),
    ("left_anchor_rod_angle", 335),
    ("right_anchor_rod_angle", 336),
    ("mud_pump_1_speed", 337),
    ("mud_pump_2_speed", 338),
    ("underwater_pump_speed", 339),
    ("flow_velocity", 340),
    ("density", 341),
    ("underwater_pump_motor_current", 342),
    ("underwater_pump_motor_voltage", 343),
    ("underwater_pump_torque", 344),
    ("underwater_pump_motor_speed", 345),
    ("mud_pump_2_diesel_load", 346),
    ("mud_pump_2_diesel_speed", 347),
    ("mud_pump_1_diesel_load", 348),
    ("mud_pump_1_diesel_speed", 349),
    ("hydraulic_pump_diesel_load", 350),
    ("hydraulic_pump_diesel_speed", 351),
    ("gate_valve_flush_pressure", 352),
    ("cutter_bearing_flush_pressure", 353),
    ("trolley_hydraulic_cylinder_pressure", 354),
    ("steel_pile_hydraulic_cylinder_pressure", 355),
    ("gate_valve_system_pressure", 356),
    ("right_transverse_pressure", 357),
    ("left_transverse_pressure", 358),
    ("trolley_travel", 359),
    ("left_transverse_speed", 360),
    ("right_transverse_speed", 361),
    ("cutter_speed", 362),
    ("mud_pump_1_discharge_pressure", 363),
    ("mud_pump_2_discharge_pressure", 364),
    ("underwater_pump_discharge_pressure", 365),
    ("underwater_pump_suction_vacuum", 366),
    ("bridge_angle", 367),
    ("compass_angle", 368),
    ("gps1_x", 369),
    ("gps1_y", 370),
    ("gps1_heading", 371),
    ("gps1_speed", 372),
    ("tide_level", 373),
    ("water_density", 374),
    ("field_slurry_density", 375),
    ("trim_angle", 376),
    ("pitch_angle", 377),
    ("compass_radian", 378),
    ("gps1_latitude", 379),
    ("gps1_longitude", 380),
    ("ear_draft", 381),
    ("transverse_speed", 382),
    ("hourly_output_rate", 384),
    ("rotation_radius", 385),
    ("cutter_x", 386),
    ("cutter_y", 387),
    ("current_shift_output", 388),
    ("current_shift_output_rate", 389),
    ("outlet_flow_velocity", 390),
    ("left_transverse_torque", 391),
    ("cutter_torque", 392),
    ("concentration", 393),
    ("flow_rate", 394),
    ("right_transverse_torque", 395),
    ("left_anchor_winch_speed", 396),
    ("left_anchor_winch_torque", 397),
    ("right_anchor_winch_speed", 398),
    ("right_anchor_winch_torque", 399),
    ("left_swing_winch_speed", 400),
    ("left_swing_winch_torque", 401),
    ("right_swing_winch_speed", 402),
    ("right_swing_winch_torque", 403),
    ("bridge_winch_speed", 404),
    ("bridge_winch_torque", 405),
    ("bridge_depth", 406),
    ("transverse_direction", 407),
    ("cutter_cutting_angle", 408),
    ("underwater_pump_power", 409),
    ("mud_pump_1_power", 410),
    ("mud_pump_2_power", 411),
    ("underwater_pump_shaft_power", 412),
    ("mud_pump_1_shaft_power", 413),
    ("mud_pump_2_shaft_power", 414),
    ("underwater_pump_efficiency", 415),
    ("mud_pump_1_efficiency", 416),
    ("mud_pump_2_efficiency", 417),
    ("pipeline_average_concentration", 418),
    ("pipeline_total_damping", 419),
    ("density_forecast", 420),
    ("cutting_thickness", 421),
    ("ship_direction", 422),
    ("gps1_signal_quality", 423),
    ("gps2_signal_quality", 424),
    ("deck_pump_1_cover_seal_pressure", 427),
    ("deck_pump_2_cover_seal_pressure", 428),
    ("deck_pump_1_shaft_seal_pressure", 429),
    ("deck_pump_2_shaft_seal_pressure", 430),
    ("cutter_drive_gate_valve_flush_pressure", 431),
    ("cutter_bearing_flush_pressure_jkt", 432),
    ("underwater_pump_cover_seal_pressure", 433),
    ("underwater_pump_shaft_seal_pressure_jkt", 434),
    ("deck_pump_1_gearbox_oil_temperature", 435),
    ("deck_pump_1_gearbox_oil_pressure", 436),
    ("deck_pump_2_gearbox_oil_temperature", 437),
    ("deck_pump_2_gearbox_oil_pressure", 438),
    ("cutter_drive_gearbox_oil_temperature", 439),
    ("cutter_drive_gearbox_oil_pressure", 440),
    ("cutter_drive_gearbox_oil_saturation", 441),
    ("underwater_pump_gearbox_oil_temperature", 442),
    ("underwater_pump_gearbox_oil_pressure", 443),
    ("underwater_pump_gearbox_oil_saturation", 444),
    ("fuel_tank_40_level", 445),
    ("mer_fuel_daily_tank_level", 453),
    ("fuel_tank_3_level", 461),
    ("lubricating_oil_tank_5_level", 462),
    ("hydraulic_oil_tank_7_level", 463),
    ("auxiliary_fuel_daily_tank_level", 464),
    ("fuel_tank_13_level", 465),
    ("fuel_tank_3a_level", 466),
    ("fuel_tank_4_level", 469),
    ("sewage_tank_6_level", 470),
    ("freshwater_tank_8_level", 471),
    ("dirty_oil_tank_11_level", 472),
    ("fuel_tank_12_level", 473),
    ("freshwater_tank_26_level", 474),
    ("fuel_tank_4a_level", 475),
];
