//! Fixed `Ed` module tables
//!
//! Function signatures, named constants, the three program variables and
//! their allowed values, the device map of the robot, and the
//! module/register naming used by the assembler. All of this is fixed by the
//! target device and reproduced bit-exactly.

use crate::program::{SigParam, TypeInfo, TypeTag};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::LazyLock;

/// The VERSION line every generated program image starts with.
pub const VERSION_STATEMENT: &str = "VERSION 6, 0";

/// The robot's fixed peripheral map, as DEVICE directives.
pub const MODULE_STATEMENTS: &[&str] = &[
    "DEVICE tracker, 0, LINE_TRACKER1",
    "DEVICE led, 1, Right_LED",
    "DEVICE motor-a, 3, Right_Motor",
    "DEVICE irrx, 5, IR_RECEIVER1",
    "DEVICE beeper, 6, SOUNDER1",
    "DEVICE irtx, 7, IR_TRANSMITTER1",
    "DEVICE motor-b, 8, Left_Motor",
    "DEVICE led, 11, Left_LED",
];

/// Index-module action bits for the slice access protocol. CONTROL bits are
/// bit numbers (used with bitset).
pub const CONTROL_INDEX_WRITE_16BIT: u8 = 1;
pub const CONTROL_INDEX_READ_16BIT: u8 = 2;
pub const CONTROL_INDEX_WRITE_8BIT: u8 = 5;
pub const CONTROL_INDEX_READ_8BIT: u8 = 6;

fn sig(params: &[SigParam]) -> Vec<SigParam> {
    params.to_vec()
}

fn s_int() -> SigParam {
    SigParam::int()
}

fn s_tag(tag: TypeTag) -> SigParam {
    SigParam::Exact(TypeInfo::plain(tag))
}

/// Signatures of every callable the `Ed` module (and the handful of Python
/// builtins) exposes. Inline functions created by the optimiser are listed
/// too so their argument types can still be checked.
pub static SIGNATURES: LazyLock<IndexMap<&'static str, Vec<SigParam>>> = LazyLock::new(|| {
    let mut m = IndexMap::new();

    // Control
    m.insert("Ed.LeftLed", sig(&[s_int()]));
    m.insert("Ed.RightLed", sig(&[s_int()]));
    m.insert("Ed.ObstacleDetectionBeam", sig(&[s_int()]));
    m.insert("Ed.LineTrackerLed", sig(&[s_int()]));
    m.insert("Ed.SendIRData", sig(&[s_int()]));
    m.insert("Ed.StartCountDown", sig(&[s_int(), s_int()]));
    m.insert("Ed.TimeWait", sig(&[s_int(), s_int()]));
    m.insert("Ed.ResetDistance", sig(&[]));

    // Music
    m.insert("Ed.PlayBeep", sig(&[]));
    m.insert("Ed.PlayMyBeep", sig(&[s_int()]));
    m.insert("Ed.PlayTone", sig(&[s_int(), s_int()]));
    m.insert("Ed.PlayTune", sig(&[s_tag(TypeTag::Tune)]));
    m.insert("Ed.ChangeTempo", sig(&[s_int()]));

    // Movement
    m.insert("Ed.Drive", sig(&[s_int(), s_int(), s_int()]));
    m.insert("Ed.DriveLeftMotor", sig(&[s_int(), s_int(), s_int()]));
    m.insert("Ed.DriveRightMotor", sig(&[s_int(), s_int(), s_int()]));
    m.insert("Ed.SetDistance", sig(&[s_int(), s_int()]));

    // Read data
    m.insert("Ed.ReadObstacleDetection", sig(&[]));
    m.insert("Ed.ReadKeypad", sig(&[]));
    m.insert("Ed.ReadClapSensor", sig(&[]));
    m.insert("Ed.ReadLineState", sig(&[]));
    m.insert("Ed.ReadLineChange", sig(&[]));
    m.insert("Ed.ReadRemote", sig(&[]));
    m.insert("Ed.ReadIRData", sig(&[]));
    m.insert("Ed.ReadLeftLightLevel", sig(&[]));
    m.insert("Ed.ReadRightLightLevel", sig(&[]));
    m.insert("Ed.ReadLineTracker", sig(&[]));
    m.insert("Ed.ReadCountDown", sig(&[s_int()]));
    m.insert("Ed.ReadMusicEnd", sig(&[]));
    m.insert("Ed.ReadDriveLoad", sig(&[]));
    m.insert("Ed.ReadDistance", sig(&[s_int()]));
    m.insert("Ed.ReadRandom", sig(&[]));
    m.insert("Ed.ReadTuneError", sig(&[]));

    // Python builtins
    m.insert("ord", sig(&[SigParam::Exact(TypeInfo::str_of_len(1))]));
    m.insert("chr", sig(&[s_int()]));
    m.insert(
        "len",
        sig(&[SigParam::AnyOf(&[
            TypeTag::Vector,
            TypeTag::Str,
            TypeTag::Tune,
            TypeTag::List,
        ])]),
    );
    m.insert("abs", sig(&[s_int()]));

    // Special variables, objects and event registration
    m.insert("Ed.List1", sig(&[s_int()]));
    m.insert("Ed.List2", sig(&[s_int(), s_tag(TypeTag::Vector)]));
    m.insert("Ed.TuneString1", sig(&[s_int()]));
    m.insert("Ed.TuneString2", sig(&[s_int(), s_tag(TypeTag::Str)]));
    m.insert("Ed.CreateObject", sig(&[s_tag(TypeTag::Str)]));
    m.insert("Ed.RegisterEventHandler", sig(&[s_int(), s_tag(TypeTag::Str)]));

    // Low level access
    m.insert("Ed.Init", sig(&[]));
    m.insert("Ed.WriteModuleRegister8Bit", sig(&[s_int(), s_int(), s_int()]));
    m.insert("Ed.ReadModuleRegister8Bit", sig(&[s_int(), s_int()]));
    m.insert("Ed.WriteModuleRegister16Bit", sig(&[s_int(), s_int(), s_int()]));
    m.insert("Ed.ReadModuleRegister16Bit", sig(&[s_int(), s_int()]));
    m.insert("Ed.ClearModuleRegisterBit", sig(&[s_int(), s_int(), s_int()]));
    m.insert("Ed.SetModuleRegisterBit", sig(&[s_int(), s_int(), s_int()]));
    m.insert("Ed.AndModuleRegister8Bit", sig(&[s_int(), s_int(), s_int()]));
    m.insert("Ed.ObjectAddr", sig(&[s_tag(TypeTag::Tune)]));

    // Simple motor functions (implemented in the code generator)
    m.insert("Ed.SimpleDriveForwardRight", sig(&[]));
    m.insert("Ed.SimpleDriveForwardLeft", sig(&[]));
    m.insert("Ed.SimpleDriveStop", sig(&[]));
    m.insert("Ed.SimpleDriveForward", sig(&[]));
    m.insert("Ed.SimpleDriveBackward", sig(&[]));
    m.insert("Ed.SimpleDriveBackwardRight", sig(&[]));
    m.insert("Ed.SimpleDriveBackwardLeft", sig(&[]));

    // Optimised drive variants, all args constant and distance unlimited
    m.insert("Ed.Drive_INLINE_UNLIMITED", sig(&[s_int(), s_int(), s_int()]));
    m.insert("Ed.DriveLeftMotor_INLINE_UNLIMITED", sig(&[s_int(), s_int(), s_int()]));
    m.insert("Ed.DriveRightMotor_INLINE_UNLIMITED", sig(&[s_int(), s_int(), s_int()]));

    m
});

/// Every named `Ed.*` constant.
pub static CONSTANTS: LazyLock<HashMap<&'static str, i64>> = LazyLock::new(|| {
    let mut m = HashMap::new();
    let mut c = |k: &'static str, v: i64| {
        m.insert(k, v);
    };

    c("Ed.ON", 1);
    c("Ed.OFF", 0);

    c("Ed.V1", 1);
    c("Ed.V2", 2);

    // Sounder note counts
    c("Ed.NOTE_A_6", 18181);
    c("Ed.NOTE_A_SHARP_6", 17167);
    c("Ed.NOTE_B_SHARP_6", 17167); // name kept for compatibility
    c("Ed.NOTE_B_6", 16202);
    c("Ed.NOTE_C_7", 15289);
    c("Ed.NOTE_C_SHARP_7", 14433);
    c("Ed.NOTE_D_7", 13622);
    c("Ed.NOTE_D_SHARP_7", 12856);
    c("Ed.NOTE_E_7", 12135);
    c("Ed.NOTE_E_SHARP_7", 12135); // name kept for compatibility
    c("Ed.NOTE_F_7", 11457);
    c("Ed.NOTE_F_SHARP_7", 10814);
    c("Ed.NOTE_G_7", 10207);
    c("Ed.NOTE_G_SHARP_7", 9632);
    c("Ed.NOTE_A_7", 9090);
    c("Ed.NOTE_A_SHARP_7", 8581);
    c("Ed.NOTE_B_SHARP_7", 8581); // name kept for compatibility
    c("Ed.NOTE_B_7", 8099);
    c("Ed.NOTE_C_8", 7644);
    c("Ed.NOTE_REST", 0);

    // Note lengths in milliseconds, whole note = 2 seconds
    c("Ed.NOTE_SIXTEENTH", 125);
    c("Ed.NOTE_EIGHT", 250);
    c("Ed.NOTE_QUARTER", 500);
    c("Ed.NOTE_HALF", 1000);
    c("Ed.NOTE_WHOLE", 2000);

    c("Ed.TEMPO_VERY_SLOW", 1000);
    c("Ed.TEMPO_SLOW", 500);
    c("Ed.TEMPO_MEDIUM", 250);
    c("Ed.TEMPO_FAST", 70);
    c("Ed.TEMPO_VERY_FAST", 1);

    // Motor directions
    c("Ed.STOP", 0);
    c("Ed.FORWARD", 1);
    c("Ed.BACKWARD", 2);
    c("Ed.DIR_COMPLEX_START", 3);
    c("Ed.FORWARD_RIGHT", 3);
    c("Ed.BACKWARD_RIGHT", 4);
    c("Ed.FORWARD_LEFT", 5);
    c("Ed.BACKWARD_LEFT", 6);
    c("Ed.DIR_SPIN_START", 7);
    c("Ed.SPIN_RIGHT", 7);
    c("Ed.SPIN_LEFT", 8);

    c("Ed.SPEED_FULL", 0);
    c("Ed.SPEED_1", 1);
    c("Ed.SPEED_2", 2);
    c("Ed.SPEED_3", 3);
    c("Ed.SPEED_4", 4);
    c("Ed.SPEED_5", 5);
    c("Ed.SPEED_6", 6);
    c("Ed.SPEED_7", 7);
    c("Ed.SPEED_8", 8);
    c("Ed.SPEED_9", 9);
    c("Ed.SPEED_10", 10);

    c("Ed.DISTANCE_UNLIMITED", 0);

    c("Ed.MOTOR_LEFT", 0x00);
    c("Ed.MOTOR_RIGHT", 0x01);

    // Motor control codes
    c("Ed.MOTOR_FOR_CODE", 0x80);
    c("Ed.MOTOR_BACK_CODE", 0x40);
    c("Ed.MOTOR_DIST_CODE", 0x20);
    c("Ed.MOTOR_FOR_DIST_CODE", 0xa0);
    c("Ed.MOTOR_BACK_DIST_CODE", 0x60);
    c("Ed.MOTOR_STOP_CODE", 0xc0);

    c("Ed.OBSTACLE_NONE", 0x00);
    c("Ed.OBSTACLE_DETECTED", 0x40);
    c("Ed.OBSTACLE_LEFT", 0x20);
    c("Ed.OBSTACLE_AHEAD", 0x10);
    c("Ed.OBSTACLE_RIGHT", 0x08);
    c("Ed.OBSTACLE_MASK", 0x78);
    c("Ed.OBSTACLE_OTHER_MASK", 0x07);

    c("Ed.LINE_ON_BLACK", 0x01);
    c("Ed.LINE_ON_WHITE", 0x00);
    c("Ed.LINE_MASK", 0x01);
    c("Ed.LINE_CHANGE_MASK", 0x02);
    c("Ed.LINE_CHANGE_BIT", 1);

    c("Ed.KEYPAD_NONE", 0x00);
    c("Ed.KEYPAD_TRIANGLE", 0x01);
    c("Ed.KEYPAD_ROUND", 0x04);
    c("Ed.KEYPAD_MASK", 0x0f);

    c("Ed.CLAP_NOT_DETECTED", 0x00);
    c("Ed.CLAP_DETECTED", 0x04);
    c("Ed.CLAP_MASK", 0x04);
    c("Ed.CLAP_DETECTED_BIT", 2);
    c("Ed.DRIVE_STRAINED", 0x01);
    c("Ed.DRIVE_NO_STRAIN", 0x00);
    c("Ed.MUSIC_FINISHED", 0x01);
    c("Ed.MUSIC_NOT_FINISHED", 0x00);
    c("Ed.TUNE_NO_ERROR", 0x00);
    c("Ed.TUNE_ERROR", 0x01);

    c("Ed.REMOTE_CODE_0", 0);
    c("Ed.REMOTE_CODE_1", 1);
    c("Ed.REMOTE_CODE_2", 2);
    c("Ed.REMOTE_CODE_3", 3);
    c("Ed.REMOTE_CODE_4", 4);
    c("Ed.REMOTE_CODE_5", 5);
    c("Ed.REMOTE_CODE_6", 6);
    c("Ed.REMOTE_CODE_7", 7);
    c("Ed.REMOTE_CODE_NONE", 255);

    c("Ed.EVENT_TIMER_FINISHED", 0);
    c("Ed.EVENT_REMOTE_CODE", 1);
    c("Ed.EVENT_IR_DATA", 2);
    c("Ed.EVENT_CLAP_DETECTED", 3);
    c("Ed.EVENT_OBSTACLE_ANY", 4);
    c("Ed.EVENT_OBSTACLE_LEFT", 5);
    c("Ed.EVENT_OBSTACLE_RIGHT", 6);
    c("Ed.EVENT_OBSTACLE_AHEAD", 7);
    c("Ed.EVENT_DRIVE_STRAIN", 8);
    c("Ed.EVENT_KEYPAD_TRIANGLE", 9);
    c("Ed.EVENT_KEYPAD_ROUND", 10);
    c("Ed.EVENT_LINE_TRACKER_ON_WHITE", 11);
    c("Ed.EVENT_LINE_TRACKER_ON_BLACK", 12);
    c("Ed.EVENT_LINE_TRACKER_SURFACE_CHANGE", 13);
    c("Ed.EVENT_TUNE_FINISHED", 14);
    c("Ed.EVENT_LAST_EVENT", 14);

    c("Ed.CM", 0x00);
    c("Ed.INCH", 0x01);
    c("Ed.TIME", 0x02);

    c("Ed.TIME_SECONDS", 0x00);
    c("Ed.TIME_MILLISECONDS", 0x01);

    // Module slots, for the low level access functions
    c("Ed.MODULE_LINE_TRACKER", 0);
    c("Ed.MODULE_RIGHT_LED", 1);
    c("Ed.MODULE_RIGHT_MOTOR", 3);
    c("Ed.MODULE_IR_RX", 5);
    c("Ed.MODULE_BEEPER", 6);
    c("Ed.MODULE_IR_TX", 7);
    c("Ed.MODULE_LEFT_MOTOR", 8);
    c("Ed.MODULE_LEFT_LED", 11);
    c("Ed.MODULE_INDEX", 12);
    c("Ed.MODULE_DEVICES", 13);
    c("Ed.MODULE_TIMERS", 14);
    c("Ed.MODULE_CPU", 15);

    // Line tracker registers
    c("Ed.REG_LT_STATUS_8", 0);
    c("Ed.REG_LT_POWER_8", 1);
    c("Ed.REG_LT_LEVEL_16", 2);

    // LED registers
    c("Ed.REG_LED_STATUS_8", 0);
    c("Ed.REG_LED_OUTPUT_8", 1);
    c("Ed.REG_LED_LEVEL_16", 2);

    // Motor registers
    c("Ed.REG_MOTOR_STATUS_8", 0);
    c("Ed.REG_MOTOR_CONTROL_8", 1);
    c("Ed.REG_MOTOR_DISTANCE_16", 2);

    // IR receiver registers
    c("Ed.REG_IRRX_STATUS_8", 0);
    c("Ed.REG_IRRX_ACTION_8", 1);
    c("Ed.REG_IRRX_CHECK_INDEX_8", 2);
    c("Ed.REG_IRRX_MATCH_INDEX_8", 3);
    c("Ed.REG_IRRX_RCV_CHAR_8", 4);

    // Beeper registers
    c("Ed.REG_BEEP_STATUS_8", 0);
    c("Ed.REG_BEEP_ACTION_8", 1);
    c("Ed.REG_BEEP_FREQ_16", 2);
    c("Ed.REG_BEEP_DURATION_16", 4);
    c("Ed.REG_BEEP_TUNE_CODE_8", 6);
    c("Ed.REG_BEEP_TUNE_STRING_8", 7);
    c("Ed.REG_BEEP_TUNE_TEMPO_16", 8);

    // IR transmitter registers
    c("Ed.REG_IRTX_ACTION_8", 0);
    c("Ed.REG_IRTX_CHAR_8", 1);

    // Devices module registers
    c("Ed.REG_DEV_STATUS_8", 0);
    c("Ed.REG_DEV_ACTION_8", 1);
    c("Ed.REG_DEV_RANDOM_8", 0x0c);
    c("Ed.REG_DEV_BUTTON_8", 0x0d);

    // Timer registers
    c("Ed.REG_TIMER_STATUS_8", 0);
    c("Ed.REG_TIMER_ACTION_8", 1);
    c("Ed.REG_TIMER_PAUSE_16", 2);
    c("Ed.REG_TIMER_ONE_SHOT_16", 4);
    c("Ed.REG_TIMER_SYS_TIME_16", 6);

    m
});

/// The program variables that MUST be assigned exactly once in `__main__`,
/// each with its tuple of allowed values. Order here fixes global layout
/// order.
pub static ED_VARIABLES: LazyLock<Vec<(&'static str, Vec<i64>)>> = LazyLock::new(|| {
    vec![
        ("Ed.EdisonVersion", vec![CONSTANTS["Ed.V1"], CONSTANTS["Ed.V2"]]),
        (
            "Ed.DistanceUnits",
            vec![CONSTANTS["Ed.CM"], CONSTANTS["Ed.INCH"], CONSTANTS["Ed.TIME"]],
        ),
        (
            "Ed.Tempo",
            vec![
                CONSTANTS["Ed.TEMPO_VERY_SLOW"],
                CONSTANTS["Ed.TEMPO_SLOW"],
                CONSTANTS["Ed.TEMPO_MEDIUM"],
                CONSTANTS["Ed.TEMPO_FAST"],
                CONSTANTS["Ed.TEMPO_VERY_FAST"],
            ],
        ),
    ]
});

pub fn ed_variable_allowed(name: &str) -> Option<&'static [i64]> {
    ED_VARIABLES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, vals)| vals.as_slice())
}

pub fn is_ed_variable(name: &str) -> bool {
    ED_VARIABLES.iter().any(|(n, _)| *n == name)
}

/// Functions not available on a given hardware version.
pub fn not_available_functions(version: i64) -> &'static [&'static str] {
    match version {
        1 => &["Ed.ResetDistance", "Ed.SetDistance", "Ed.ReadDistance"],
        _ => &[],
    }
}

/// One peripheral type the assembler knows how to address.
pub struct DeviceType {
    pub name: &'static str,
    pub code: u8,
    /// register name -> register number (0..15)
    pub registers: &'static [(&'static str, u8)],
}

/// Addressable device types; `DEVICE type, location, name` lines bind a
/// location (module slot) to one of these.
pub const DEVICE_TYPES: &[DeviceType] = &[
    DeviceType {
        name: "tracker",
        code: 1,
        registers: &[("status", 0), ("power", 1), ("level", 2)],
    },
    DeviceType {
        name: "led",
        code: 2,
        registers: &[("status", 0), ("output", 1), ("level", 2)],
    },
    DeviceType {
        name: "motor-a",
        code: 3,
        registers: &[("status", 0), ("control", 1), ("distance", 2)],
    },
    DeviceType {
        name: "motor-b",
        code: 4,
        registers: &[("status", 0), ("control", 1), ("distance", 2)],
    },
    DeviceType {
        name: "irrx",
        code: 5,
        registers: &[
            ("status", 0),
            ("action", 1),
            ("checkindex", 2),
            ("matchindex", 3),
            ("rcvchar", 4),
        ],
    },
    DeviceType {
        name: "beeper",
        code: 6,
        registers: &[
            ("status", 0),
            ("action", 1),
            ("freq", 2),
            ("duration", 4),
            ("tunecode", 6),
            ("tunestring", 7),
            ("tempo", 8),
        ],
    },
    DeviceType {
        name: "irtx",
        code: 7,
        registers: &[("action", 0), ("char", 1)],
    },
];

/// Built-in modules always present at fixed slots (no DEVICE line needed).
pub const BUILTIN_MODULES: &[(&str, u8, &[(&str, u8)])] = &[
    (
        "_index",
        12,
        &[
            ("status", 0),
            ("action", 1),
            ("8b1cursor", 2),
            ("8b1window", 3),
            ("16b1cursor", 4),
            ("16b1window", 5),
        ],
    ),
    (
        "_devices",
        13,
        &[("status", 0), ("action", 1), ("random", 0x0c), ("button", 0x0d)],
    ),
    (
        "_timers",
        14,
        &[
            ("status", 0),
            ("action", 1),
            ("pause", 2),
            ("oneshot", 4),
            ("systime", 6),
        ],
    ),
    ("_cpu", 15, &[("acc", 0)]),
];

pub fn device_type(name: &str) -> Option<&'static DeviceType> {
    DEVICE_TYPES.iter().find(|d| d.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_have_fixed_values() {
        assert_eq!(CONSTANTS["Ed.ON"], 1);
        assert_eq!(CONSTANTS["Ed.MODULE_LEFT_LED"], 11);
        assert_eq!(CONSTANTS["Ed.MOTOR_STOP_CODE"], 0xc0);
        assert_eq!(CONSTANTS["Ed.EVENT_LAST_EVENT"], 14);
        assert_eq!(CONSTANTS["Ed.NOTE_C_7"], 15289);
    }

    #[test]
    fn ed_variable_rules() {
        assert!(is_ed_variable("Ed.Tempo"));
        assert!(!is_ed_variable("Ed.Speed"));
        assert_eq!(ed_variable_allowed("Ed.EdisonVersion"), Some(&[1i64, 2][..]));
        assert!(ed_variable_allowed("Ed.Tempo").unwrap().contains(&250));
    }

    #[test]
    fn v1_restrictions() {
        assert!(not_available_functions(1).contains(&"Ed.ReadDistance"));
        assert!(not_available_functions(2).is_empty());
    }

    #[test]
    fn signature_table_covers_builtins() {
        assert_eq!(SIGNATURES["Ed.Drive"].len(), 3);
        assert!(matches!(SIGNATURES["len"][0], SigParam::AnyOf(_)));
        assert!(SIGNATURES.contains_key("Ed.Drive_INLINE_UNLIMITED"));
    }

    #[test]
    fn device_register_lookup() {
        let motor = device_type("motor-b").unwrap();
        assert_eq!(
            motor.registers.iter().find(|(n, _)| *n == "control").unwrap().1,
            1
        );
        let cpu = BUILTIN_MODULES.iter().find(|(n, _, _)| *n == "_cpu").unwrap();
        assert_eq!(cpu.1, 15);
    }
}
