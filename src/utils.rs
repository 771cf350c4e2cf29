use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u32};
use nom::IResult;

pub struct Utils;

impl Utils {
    pub fn be_u16_div10(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, num) = be_u16(input)?;
        Ok((input, num as f64 / 10.0))
    }

    pub fn be_u16_div100(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, num) = be_u16(input)?;
        Ok((input, num as f64 / 100.0))
    }

    pub fn be_u32_div10(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, num) = be_u32(input)?;
        Ok((input, num as f64 / 10.0))
    }

    /// Fixed-width text field, one byte per character. Devices pad with
    /// NULs or spaces, which are trimmed from the end.
    pub fn ascii(input: &[u8], len: usize) -> IResult<&[u8], String> {
        let (input, raw) = take(len)(input)?;
        let text: String = raw.iter().map(|&b| b as char).collect();
        let trimmed = text.trim_end_matches(|c: char| c == '\0' || c == ' ');
        Ok((input, trimmed.to_string()))
    }

    /// Hex dump in the `68-02-40-30` style used in log lines.
    pub fn hex(data: &[u8]) -> String {
        data.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join("-")
    }
}
