use crate::error::{Error, Result};
use crate::utils::Utils;

use bytes::Bytes;
use nom_derive::{Nom, Parse};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Serialize, Serializer};

pub const REQUEST_FRAME_LEN: usize = 16;

/// Shortest buffer `FrameCodec::decode` accepts.
pub const MIN_FRAME_LEN: usize = 131;

/// Length of a frame pushed by the device to a listener.
pub const PUSH_FRAME_LEN: usize = 139;

/// Pulled frames vary a little between firmware versions.
pub const PULL_FRAME_LEN: std::ops::RangeInclusive<usize> = 130..=150;

// WifiSerial {{{
/// Serial number of the wifi logger module, as printed on its label.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WifiSerial(u32);

impl WifiSerial {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Least significant byte first, the order the device uses on the wire.
    pub fn wire_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl From<u32> for WifiSerial {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl std::str::FromStr for WifiSerial {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidSerialNumber(s.to_string()));
        }

        s.parse::<u32>()
            .map(Self)
            .map_err(|_| Error::InvalidSerialNumber(s.to_string()))
    }
}

impl std::fmt::Display for WifiSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for WifiSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for WifiSerial {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
} // }}}

// RequestFrame {{{
/// The 16 byte "send me your statistics" request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RequestFrame([u8; REQUEST_FRAME_LEN]);

impl RequestFrame {
    pub fn new(serial: WifiSerial) -> Self {
        let s = serial.wire_bytes();

        let mut r = [0u8; REQUEST_FRAME_LEN];
        r[0..4].copy_from_slice(&[0x68, 0x02, 0x40, 0x30]);
        r[4..8].copy_from_slice(&s);
        r[8..12].copy_from_slice(&s);
        r[12] = 0x01;
        r[13] = 0x00;
        r[14] = Self::checksum(&s);
        r[15] = 0x16;

        Self(r)
    }

    fn checksum(serial: &[u8; 4]) -> u8 {
        let sum: u32 = serial.iter().map(|&b| u32::from(b)).sum();
        ((sum * 2 + 115) & 0xff) as u8
    }

    pub fn as_bytes(&self) -> &[u8; REQUEST_FRAME_LEN] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl AsRef<[u8]> for RequestFrame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
} // }}}

// Channel {{{
/// One of the (up to) three measurement channels of an inverter.
#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Channel {
    One = 1,
    Two = 2,
    Three = 3,
} // }}}

// Statistics {{{
/// One decoded telemetry frame. Built once from the raw bytes and never
/// changed afterwards; use the accessors to read it.
#[derive(Clone, Debug, PartialEq, Serialize, Nom)]
#[nom(BigEndian)]
pub struct Statistics {
    #[nom(Ignore)]
    #[serde(skip)]
    raw: Bytes,

    #[nom(SkipBefore(4))]
    #[nom(Parse = "nom::number::complete::le_u32")]
    #[serde(serialize_with = "ser_wifi_serial")]
    wifi_serial: u32,

    #[nom(SkipBefore(7))]
    #[nom(Parse = "{ |i| Utils::ascii(i, 16) }")]
    inverter_serial: String,

    #[nom(Parse = "Utils::be_u16_div10")]
    temperature: f64,

    #[nom(Parse = "Utils::be_u16_div10")]
    v_dc_1: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    v_dc_2: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    v_dc_3: f64,

    #[nom(Parse = "Utils::be_u16_div10")]
    i_dc_1: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    i_dc_2: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    i_dc_3: f64,

    #[nom(Parse = "Utils::be_u16_div10")]
    i_ac_1: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    i_ac_2: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    i_ac_3: f64,

    #[nom(Parse = "Utils::be_u16_div10")]
    v_ac_1: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    v_ac_2: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    v_ac_3: f64,

    #[nom(Parse = "Utils::be_u16_div100")]
    f_ac: f64,

    p_ac_1: u16,

    #[nom(SkipBefore(8))]
    #[nom(Parse = "Utils::be_u16_div100")]
    e_today: f64,
    #[nom(Parse = "Utils::be_u32_div10")]
    e_total: f64,

    hours_active: u32,

    #[nom(SkipBefore(22))]
    #[nom(Parse = "{ |i| Utils::ascii(i, 15) }")]
    main_firmware: String,

    #[nom(SkipBefore(5))]
    #[nom(Parse = "{ |i| Utils::ascii(i, 9) }")]
    slave_firmware: String,
}

impl Statistics {
    pub fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < MIN_FRAME_LEN {
            return Err(Error::FrameTooShort {
                len: input.len(),
                min: MIN_FRAME_LEN,
            });
        }

        match Statistics::parse(input) {
            Ok((_, mut r)) => {
                r.raw = Bytes::copy_from_slice(input);
                Ok(r)
            }
            Err(e) => Err(Error::Parse(format!("{:?}", e))),
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn wifi_serial(&self) -> WifiSerial {
        WifiSerial(self.wifi_serial)
    }

    pub fn wifi_module_serial_number(&self) -> String {
        self.wifi_serial.to_string()
    }

    pub fn inverter_serial_number(&self) -> &str {
        &self.inverter_serial
    }

    pub fn main_firmware_version(&self) -> &str {
        &self.main_firmware
    }

    pub fn slave_firmware_version(&self) -> &str {
        &self.slave_firmware
    }

    /// Degrees Celsius.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn hours_active(&self) -> u32 {
        self.hours_active
    }

    /// Panel side voltage in volts.
    pub fn dc_voltage(&self, channel: Channel) -> f64 {
        match channel {
            Channel::One => self.v_dc_1,
            Channel::Two => self.v_dc_2,
            Channel::Three => self.v_dc_3,
        }
    }

    /// Panel side current in amps.
    pub fn dc_current(&self, channel: Channel) -> f64 {
        match channel {
            Channel::One => self.i_dc_1,
            Channel::Two => self.i_dc_2,
            Channel::Three => self.i_dc_3,
        }
    }

    /// Grid side voltage in volts.
    pub fn ac_voltage(&self, channel: Channel) -> f64 {
        match channel {
            Channel::One => self.v_ac_1,
            Channel::Two => self.v_ac_2,
            Channel::Three => self.v_ac_3,
        }
    }

    /// Grid side current in amps.
    pub fn ac_current(&self, channel: Channel) -> f64 {
        match channel {
            Channel::One => self.i_ac_1,
            Channel::Two => self.i_ac_2,
            Channel::Three => self.i_ac_3,
        }
    }

    /// Grid frequency in Hz.
    pub fn ac_frequency(&self) -> f64 {
        self.f_ac
    }

    /// Current output in watts. Only channel one is known to be reported.
    pub fn current_power(&self, channel: Channel) -> Result<u16> {
        match channel {
            Channel::One => Ok(self.p_ac_1),
            Channel::Two => Err(Error::NotImplemented("current power on channel 2")),
            Channel::Three => Err(Error::NotImplemented("current power on channel 3")),
        }
    }

    /// kWh produced today.
    pub fn production_today(&self) -> f64 {
        self.e_today
    }

    /// kWh produced since installation.
    pub fn production_total(&self) -> f64 {
        self.e_total
    }

    /// Every decoded field, keyed by field name, for log lines and JSON
    /// consumers. The wifi serial is written as a string.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

fn ser_wifi_serial<S>(value: &u32, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    WifiSerial(*value).serialize(serializer)
}

impl TryFrom<&[u8]> for Statistics {
    type Error = Error;

    fn try_from(input: &[u8]) -> Result<Self> {
        Self::decode(input)
    }
} // }}}

/// Stateless encode/decode entry points for the wire protocol.
pub struct FrameCodec;

impl FrameCodec {
    pub fn encode(serial: &str) -> Result<RequestFrame> {
        let serial: WifiSerial = serial.parse()?;
        Ok(RequestFrame::new(serial))
    }

    pub fn decode(input: &[u8]) -> Result<Statistics> {
        Statistics::decode(input)
    }

    pub fn is_push_frame(len: usize) -> bool {
        len == PUSH_FRAME_LEN
    }

    pub fn is_pull_frame(len: usize) -> bool {
        PULL_FRAME_LEN.contains(&len)
    }
}
