pub const LOG_LEVEL: &str = "LOG_LEVEL";
