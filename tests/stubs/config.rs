#![allow(dead_code)]
// This is infuriating, but rust-analyzer seems to arbitrarily think
// that some of these are unused; hence the warning suppression

pub const VALID_PAYLOAD: &str = r#"
{
    "bus": {
        "port": "/dev/ttyUSB0",
        "baud": 19200,
        "parity": "even",
        "stop_bits": 1,
        "response_timeout_ms": 500,
        "max_retries": 3,
        "backoff_ms": [10, 50],
        "poll_interval_s": 1
    },
    "devices": {
        "boiler": {
            "slave": 2,
            "points": {
                "bottemp": { "kind": "holding_register", "offset": 0, "signed": true },
                "toptemp": { "kind": "holding_register", "offset": 1, "signed": true },
                "heatpump": { "kind": "coil", "offset": 0 }
            }
        },
        "shower": {
            "slave": 3,
            "points": {
                "running": { "kind": "discrete_input", "offset": 0 },
                "pump": { "kind": "coil", "offset": 0 }
            }
        }
    },
    "causations": [
        {
            "when": { "or": [
                { "range": { "point": "boiler.bottemp", "high": 54 } },
                { "range": { "point": "boiler.toptemp", "high": 54 } }
            ] },
            "then_off": "boiler.heatpump"
        },
        {
            "when": { "period": {
                "source": { "active": { "point": "shower.running" } },
                "start_s": 1200,
                "stop_s": 3600
            } },
            "then_off": "shower.pump"
        }
    ]
}
"#;

pub const UNKNOWN_POINT_PAYLOAD: &str = r#"
{
    "bus": { "port": "/dev/ttyUSB0", "baud": 9600 },
    "devices": {
        "boiler": {
            "slave": 2,
            "points": {
                "heatpump": { "kind": "coil", "offset": 0 }
            }
        }
    },
    "causations": [
        {
            "when": { "range": { "point": "boiler.toptemp", "high": 54 } },
            "then_off": "boiler.heatpump"
        }
    ]
}
"#;

pub const BAD_PAYLOAD: &str = r#"
{
    "bus": { "port": "/dev/ttyUSB0" },
    "devices": "none"
}
"#;
