//! Human-readable packet descriptions for the debug log.

use std::fmt::Write as _;

use serde_json::Value;

/// Telegram command types (first payload byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Direct,
    System,
    Reply,
    DirectNoReply,
    SystemNoReply,
    Other(u8),
}

impl CommandType {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Self::Direct,
            0x01 => Self::System,
            0x02 => Self::Reply,
            0x80 => Self::DirectNoReply,
            0x81 => Self::SystemNoReply,
            other => Self::Other(other),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Direct => "DIRECT_CMD".into(),
            Self::System => "SYSTEM_CMD".into(),
            Self::Reply => "REPLY".into(),
            Self::DirectNoReply => "DIRECT_CMD_NO_REPLY".into(),
            Self::SystemNoReply => "SYSTEM_CMD_NO_REPLY".into(),
            Self::Other(byte) => format!("0x{:02X}", byte),
        }
    }
}

/// Name of a direct or system opcode (second payload byte).
pub fn opcode_name(opcode: u8) -> Option<&'static str> {
    let name = match opcode {
        0x03 => "PLAY_TONE",
        0x04 => "SET_OUT_STATE",
        0x05 => "SET_IN_MODE",
        0x06 => "GET_OUT_STATE",
        0x07 => "GET_IN_VALS",
        0x08 => "RESET_IN_VAL",
        0x09 => "MESSAGE_WRITE",
        0x0A => "RESET_POSITION",
        0x0B => "GET_BATT_LVL",
        0x0C => "STOP_SOUND",
        0x0D => "KEEP_ALIVE",
        0x0E => "LS_GET_STATUS",
        0x0F => "LS_WRITE",
        0x10 => "LS_READ",
        0x11 => "GET_CURR_PROGRAM",
        0x13 => "MESSAGE_READ",
        0x81 => "OPEN_READ",
        0x82 => "OPEN_WRITE",
        0x83 => "READ",
        0x84 => "WRITE",
        0x85 => "CLOSE",
        0x86 => "DELETE",
        0x87 => "FIND_FIRST",
        0x88 => "FIND_NEXT",
        0x89 => "GET_FIRMWARE_VERSION",
        0x8A => "OPEN_WRITE_LINEAR",
        0x8B => "OPEN_READ_LINEAR",
        0x8C => "OPEN_WRITE_DATA",
        0x8D => "OPEN_APPEND_DATA",
        0x90 => "BOOT",
        0x91 => "SET_BRICK_NAME",
        0x92 => "GET_DEVICE_INFO",
        0x93 => "DELETE_USER_FLASH",
        0x94 => "READ_IO_MAP",
        0x95 => "WRITE_IO_MAP",
        0x96 => "RENAME_FILE",
        0x97 => "BTFACTORYRESET",
        _ => return None,
    };
    Some(name)
}

/// Text for a non-zero reply status byte.
pub fn status_text(status: u8) -> Option<&'static str> {
    let text = match status {
        0x00 => "Success",
        0x20 => "Pending communication transaction in progress",
        0x40 => "Specified mailbox queue is empty",
        0x81 => "No more handles",
        0x82 => "No space",
        0x83 => "No more files",
        0x84 => "End of file expected",
        0x85 => "End of file",
        0x86 => "Not a linear file",
        0x87 => "File not found",
        0x88 => "Handle already closed",
        0x89 => "No linear space",
        0x8A => "Undefined error",
        0x8B => "File is busy",
        0x8C => "No write buffers",
        0x8D => "Append not possible",
        0x8E => "File is full",
        0x8F => "File exists",
        0x90 => "Module not found",
        0x91 => "Out of boundary",
        0x92 => "Illegal file name",
        0x93 => "Illegal handle",
        0xBD => "Request failed (i.e. specified file not found)",
        0xBE => "Unknown command opcode",
        0xBF => "Insane packet",
        0xC0 => "Data contains out-of-range values",
        0xDD => "Communication bus error",
        0xDE => "No free memory in communication buffer",
        0xDF => "Specified channel/connection is not valid",
        0xE0 => "Specified channel/connection not configured or busy",
        0xEC => "No active program",
        0xED => "Illegal size specified",
        0xEE => "Illegal mailbox queue ID specified",
        0xEF => "Attempted to access invalid field of a structure",
        0xF0 => "Bad input or output specified",
        0xFB => "Insufficient memory available",
        0xFF => "Bad arguments",
        _ => return None,
    };
    Some(text)
}

/// Describe a framed telegram (header included). Packets shorter than a
/// header plus command type and opcode yield an empty string.
pub fn telegram(data: &[u8]) -> String {
    if data.len() < 4 {
        return String::new();
    }

    let length = usize::from(data[0]) | (usize::from(data[1]) << 8);
    let command = CommandType::from_byte(data[2]);
    let opcode = data[3];
    let op_name = opcode_name(opcode)
        .map(str::to_string)
        .unwrap_or_else(|| format!("0x{:02X}", opcode));

    let mut out = format!("[Len:{}] [{} → {}]", length, command.name(), op_name);

    if command == CommandType::Reply && data.len() >= 5 {
        let status = data[4];
        if status == 0x00 {
            out.push_str(" [Success]");
        } else {
            let text = status_text(status)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Unknown error 0x{:02X}", status));
            let _ = write!(out, " [Error: {}]", text);
        }
    }

    match opcode {
        0x04 if data.len() >= 14 => {
            let port = data[4];
            let power = data[5] as i8;
            let mode = data[6];
            let _ = write!(out, " [Port:{} Power:{} Mode:{}]", port, power, mode);
        }
        0x0B if data.len() >= 7 && command == CommandType::Reply => {
            let millivolts = u16::from(data[5]) | (u16::from(data[6]) << 8);
            let _ = write!(out, " [Battery:{}mV]", millivolts);
        }
        0x07 if data.len() >= 16 && command == CommandType::Reply => {
            let port = data[4];
            let valid = data[5];
            let value = u16::from(data[14]) | (u16::from(data[15]) << 8);
            let _ = write!(out, " [Port:{} Valid:{} Value:{}]", port, valid, value);
        }
        _ => {}
    }

    out
}

fn boost_message_type(kind: u8) -> Option<&'static str> {
    let name = match kind {
        0x01 => "HUB_PROPERTIES",
        0x02 => "HUB_ACTIONS",
        0x03 => "HUB_ALERTS",
        0x04 => "HUB_ATTACHED_IO",
        0x05 => "ERROR",
        0x41 => "PORT_INPUT_FORMAT_SETUP_SINGLE",
        0x42 => "PORT_INPUT_FORMAT_SETUP_COMBINED",
        0x43 => "PORT_INFORMATION",
        0x44 => "PORT_MODE_INFORMATION",
        0x45 => "PORT_VALUE",
        0x46 => "PORT_VALUE_COMBINED",
        0x47 => "PORT_INPUT_FORMAT",
        0x48 => "PORT_INPUT_FORMAT_COMBINED",
        0x81 => "OUTPUT",
        0x82 => "PORT_FEEDBACK",
        _ => return None,
    };
    Some(name)
}

fn boost_device_type(kind: u8) -> Option<&'static str> {
    let name = match kind {
        0x00 => "UNKNOWN",
        0x01 => "MOTOR_WEDO",
        0x02 => "MOTOR_SYSTEM",
        0x05 => "BUTTON",
        0x08 => "LIGHT",
        0x14 => "VOLTAGE",
        0x15 => "CURRENT",
        0x16 => "PIEZO",
        0x17 => "LED",
        0x22 => "TILT_EXTERNAL",
        0x23 => "MOTION_SENSOR",
        0x25 => "COLOR_DISTANCE",
        0x26 => "MOTOREXT",
        0x27 => "MOTORINT",
        0x28 => "TILT",
        0x3F => "FORCE_SENSOR",
        _ => return None,
    };
    Some(name)
}

/// Describe a LEGO wireless protocol packet as seen on the Boost
/// characteristic.
pub fn boost_packet(data: &[u8]) -> String {
    if data.len() < 3 {
        return String::new();
    }

    let kind = data[2];
    let kind_name = boost_message_type(kind)
        .map(str::to_string)
        .unwrap_or_else(|| format!("0x{:02X}", kind));
    let mut out = format!("[Len:{} Hub:{} Type:{}]", data[0], data[1], kind_name);

    match kind {
        0x04 if data.len() >= 6 => match data[4] {
            0x01 => {
                let device = boost_device_type(data[5])
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("0x{:02X}", data[5]));
                let _ = write!(out, " [Port:{} Attached:{}]", data[3], device);
            }
            0x00 => {
                let _ = write!(out, " [Port:{} Detached]", data[3]);
            }
            _ => {}
        },
        0x45 if data.len() >= 5 => {
            let _ = write!(out, " [Port:{} Value:{}]", data[3], data[4]);
        }
        0x01 if data.len() >= 6 && data[3] == 0x06 => {
            let _ = write!(out, " [Battery:{}%]", data[5]);
        }
        _ => {}
    }

    out
}

fn spike_message_name(kind: i64) -> Option<&'static str> {
    let name = match kind {
        0 => "HUB_STATUS",
        1 => "RUNTIME_ERROR",
        2 => "BATTERY_UPDATE",
        3 => "BUTTON_EVENT",
        4 => "ORIENTATION_EVENT",
        5 => "PORT_EVENT",
        _ => return None,
    };
    Some(name)
}

fn is_set(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Description of one SPIKE hub line: a JSON status message (`m` is the
/// message type, `p` its payload) or a tagged REPL output line.
pub fn spike_line(line: &str) -> String {
    let message = match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(message)) => message,
        _ => return spike_repl_tag(line).to_string(),
    };

    let kind = message.get("m").and_then(Value::as_i64).unwrap_or(-1);
    let mut out = match spike_message_name(kind) {
        Some(name) => format!("[{}]", name),
        None => format!("[MSG_{}]", kind),
    };
    let payload = message.get("p").and_then(Value::as_array);
    match (kind, payload) {
        (0, Some(p)) if !p.is_empty() => {
            let _ = write!(out, " [Ports:{}]", p.iter().filter(|v| is_set(v)).count());
        }
        (2, Some(p)) if p.len() >= 2 => {
            let _ = write!(out, " [Battery:{}%]", plain(&p[1]));
        }
        (3, Some(p)) if p.len() >= 2 => {
            let _ = write!(out, " [Button:{} Pressed:{}]", plain(&p[0]), plain(&p[1]));
        }
        _ => {}
    }
    out
}

fn spike_repl_tag(line: &str) -> &'static str {
    if line.starts_with("SENSORS:") {
        "[Sensor Data]"
    } else if line.starts_with("MOTOR:") {
        "[Motor Data]"
    } else if line.starts_with("GESTURE:") {
        "[Gesture Event]"
    } else if line.contains("PYTHON_AVAILABLE") {
        "[Python Ready]"
    } else if line.starts_with(">>>") || line.starts_with("...") {
        "[Python REPL]"
    } else {
        ""
    }
}

/// Upper-case hex dump, truncated to `max_chars` characters.
pub fn hex_dump(data: &[u8], max_chars: usize) -> String {
    let mut text = hex::encode_upper(data);
    if text.len() > max_chars {
        text.truncate(max_chars);
        text.push_str("...");
    }
    text
}
