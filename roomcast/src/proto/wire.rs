//! SlimProto wire format.
//!
//! Inbound (client to server) commands carry a 4-byte ASCII opcode followed
//! by a big-endian `u32` payload length. Outbound (server to client)
//! commands are framed the other way around: a big-endian `u16` length
//! first, then the opcode and payload. All multi-byte integers are
//! big-endian on the wire.

use nom::bytes::complete::take;
use nom::combinator::opt;
use nom::number::complete::{be_u16, be_u32, be_u64, u8 as byte};
use nom::IResult;
use tracing::debug;

use crate::encoder::Format;
use crate::proto::ProtoError;

/// Upper bound on a declared inbound payload; anything larger is a
/// protocol violation rather than a frame to accumulate.
pub const MAX_FRAME_SIZE: usize = 16 * 1024;

/// A complete inbound command frame borrowed from the session buffer.
pub struct InboundFrame<'a> {
    pub opcode: [u8; 4],
    pub payload: &'a [u8],
}

/// Try to split one complete frame off `input`. Returns `Ok(None)` while the
/// declared length exceeds the available bytes, in which case the caller
/// accumulates and retries; zero bytes are consumed.
pub fn parse_frame(input: &[u8]) -> Result<Option<(usize, InboundFrame<'_>)>, ProtoError> {
    if input.len() < 8 {
        return Ok(None);
    }

    let opcode: [u8; 4] = input[0..4].try_into().expect("checked length");
    let length = u32::from_be_bytes(input[4..8].try_into().expect("checked length")) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtoError::Malformed {
            command: String::from_utf8_lossy(&opcode).into_owned(),
            reason: format!("declared length {length} exceeds limit"),
        });
    }
    if input.len() < 8 + length {
        return Ok(None);
    }

    Ok(Some((
        8 + length,
        InboundFrame {
            opcode,
            payload: &input[8..8 + length],
        },
    )))
}

/// Client announce.
#[derive(Debug, Clone)]
pub struct Helo {
    pub device_id: u8,
    pub revision: u8,
    pub mac: [u8; 6],
    pub uuid: [u8; 16],
    pub wlan_channel_list: u16,
    pub bytes_received: u64,
    pub language: Option<[u8; 2]>,
}

impl Helo {
    /// The stable client identity: the device MAC, formatted.
    pub fn client_id(&self) -> String {
        let m = &self.mac;
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

fn helo_fields(input: &[u8]) -> IResult<&[u8], Helo> {
    let (input, device_id) = byte(input)?;
    let (input, revision) = byte(input)?;
    let (input, mac) = take(6usize)(input)?;
    let (input, uuid) = take(16usize)(input)?;
    let (input, wlan_channel_list) = be_u16(input)?;
    let (input, bytes_received) = be_u64(input)?;
    let (input, language) = opt(take(2usize))(input)?;

    Ok((
        input,
        Helo {
            device_id,
            revision,
            mac: mac.try_into().expect("taken 6 bytes"),
            uuid: uuid.try_into().expect("taken 16 bytes"),
            wlan_channel_list,
            bytes_received,
            language: language.map(|l| l.try_into().expect("taken 2 bytes")),
        },
    ))
}

pub fn parse_helo(payload: &[u8]) -> Result<Helo, ProtoError> {
    helo_fields(payload)
        .map(|(_, helo)| helo)
        .map_err(|e| ProtoError::Malformed {
            command: "HELO".to_string(),
            reason: e.to_string(),
        })
}

/// Periodic client status.
#[derive(Debug, Clone)]
pub struct Stat {
    pub event: [u8; 4],
    pub crlf_count: u8,
    pub mas_initialized: u8,
    pub mas_mode: u8,
    pub stream_buffer_size: u32,
    pub stream_buffer_fullness: u32,
    pub bytes_received: u64,
    pub signal_strength: u16,
    pub jiffies: u32,
    pub output_buffer_size: u32,
    pub output_buffer_fullness: u32,
    pub elapsed_seconds: u32,
    pub voltage: u16,
    pub elapsed_milliseconds: u32,
    /// Echo of the key carried by the matching `strm(time)` ping.
    pub server_timestamp: u32,
    pub error_code: u16,
}

impl Stat {
    pub fn event_str(&self) -> String {
        String::from_utf8_lossy(&self.event).into_owned()
    }
}

fn stat_fields(input: &[u8]) -> IResult<&[u8], Stat> {
    let (input, event) = take(4usize)(input)?;
    let (input, crlf_count) = byte(input)?;
    let (input, mas_initialized) = byte(input)?;
    let (input, mas_mode) = byte(input)?;
    let (input, stream_buffer_size) = be_u32(input)?;
    let (input, stream_buffer_fullness) = be_u32(input)?;
    let (input, bytes_received) = be_u64(input)?;
    let (input, signal_strength) = be_u16(input)?;
    let (input, jiffies) = be_u32(input)?;
    let (input, output_buffer_size) = be_u32(input)?;
    let (input, output_buffer_fullness) = be_u32(input)?;
    let (input, elapsed_seconds) = be_u32(input)?;
    let (input, voltage) = be_u16(input)?;
    let (input, elapsed_milliseconds) = be_u32(input)?;
    let (input, server_timestamp) = be_u32(input)?;
    let (input, error_code) = be_u16(input)?;

    Ok((
        input,
        Stat {
            event: event.try_into().expect("taken 4 bytes"),
            crlf_count,
            mas_initialized,
            mas_mode,
            stream_buffer_size,
            stream_buffer_fullness,
            bytes_received,
            signal_strength,
            jiffies,
            output_buffer_size,
            output_buffer_fullness,
            elapsed_seconds,
            voltage,
            elapsed_milliseconds,
            server_timestamp,
            error_code,
        },
    ))
}

pub fn parse_stat(payload: &[u8]) -> Result<Stat, ProtoError> {
    stat_fields(payload)
        .map(|(_, stat)| stat)
        .map_err(|e| ProtoError::Malformed {
            command: "STAT".to_string(),
            reason: e.to_string(),
        })
}

/// Reason codes carried by a DSCO disconnect notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ConnectionClosed,
    ConnectionReset,
    Timeout,
    Unknown(u8),
}

impl From<u8> for DisconnectReason {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::ConnectionClosed,
            1 => Self::ConnectionReset,
            2 => Self::Timeout,
            other => Self::Unknown(other),
        }
    }
}

/// The client reports its data connection went away.
pub fn parse_dsco(payload: &[u8]) -> Result<DisconnectReason, ProtoError> {
    byte::<_, nom::error::Error<&[u8]>>(payload)
        .map(|(_, code)| DisconnectReason::from(code))
        .map_err(|e| ProtoError::Malformed {
            command: "DSCO".to_string(),
            reason: e.to_string(),
        })
}

/// Device settings reply: the queried id plus its value (the player name
/// for [`DeviceId::RequestName`]).
pub fn parse_setd(payload: &[u8]) -> Result<(u8, String), ProtoError> {
    byte::<_, nom::error::Error<&[u8]>>(payload)
        .map(|(value, id)| (id, String::from_utf8_lossy(value).trim_end_matches('\0').to_string()))
        .map_err(|e| ProtoError::Malformed {
            command: "SETD".to_string(),
            reason: e.to_string(),
        })
}

/// Device setting ids used by outbound `setd` queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceId {
    RequestName = 0,
    Squeezebox3 = 4,
}

/// Prefix an outbound command body with its big-endian `u16` length.
fn frame(body: Vec<u8>) -> Vec<u8> {
    let mut framed = Vec::with_capacity(2 + body.len());
    framed.extend_from_slice(&(body.len() as u16).to_be_bytes());
    framed.extend_from_slice(&body);
    framed
}

fn strm_body(
    command: u8,
    format: Option<(Format, u16, u32)>,
    replay_gain: u32,
    server_port: u16,
    http_request: Option<&str>,
) -> Vec<u8> {
    let mut body = Vec::with_capacity(28 + http_request.map(str::len).unwrap_or(0));
    body.extend_from_slice(b"strm");
    body.push(command);
    body.push(b'0'); // no autostart; the client waits for its own connect

    match format {
        Some((Format::Pcm, bits_per_sample, sampling_rate)) => {
            body.push(b'p');
            body.push(map_pcm_sample_size(bits_per_sample));
            body.push(map_pcm_sampling_rate(sampling_rate));
            body.push(b'2'); // stereo
            body.push(b'1'); // WAV endianness
        }
        Some((Format::Flac, _, _)) => {
            // Self-describing stream: the client reads the parameters from
            // the FLAC headers.
            body.extend_from_slice(b"f????");
        }
        None => {
            body.extend_from_slice(b"p????");
        }
    }

    body.push(0); // threshold
    body.push(0); // spdif enable
    body.push(0); // transition period
    body.push(0); // transition type
    body.push(0); // flags
    body.push(0); // output threshold
    body.push(0); // slaves
    body.extend_from_slice(&replay_gain.to_be_bytes());
    body.extend_from_slice(&server_port.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes()); // server IP: this host

    if let Some(request) = http_request {
        body.extend_from_slice(request.as_bytes());
    }

    frame(body)
}

/// `strm(start)`: directs the client at the HTTP data port.
pub fn strm_start(
    format: Format,
    bits_per_sample: u16,
    http_port: u16,
    sampling_rate: u32,
    client_id: &str,
) -> Vec<u8> {
    let request = format!("GET /stream?player={client_id}");
    strm_body(
        b's',
        Some((format, bits_per_sample, sampling_rate)),
        0,
        http_port,
        Some(&request),
    )
}

pub fn strm_stop() -> Vec<u8> {
    strm_body(b'q', None, 0, 0, None)
}

/// `strm(time)` ping; the cache key rides in the replay-gain field and comes
/// back in STAT's `server_timestamp`.
pub fn strm_time(key: u32) -> Vec<u8> {
    strm_body(b't', None, key, 0, None)
}

pub fn strm_pause() -> Vec<u8> {
    strm_body(b'p', None, 0, 0, None)
}

pub fn strm_unpause() -> Vec<u8> {
    strm_body(b'u', None, 0, 0, None)
}

/// Enable or disable the SPDIF and DAC outputs.
pub fn aude(spdif: bool, dac: bool) -> Vec<u8> {
    let mut body = Vec::with_capacity(6);
    body.extend_from_slice(b"aude");
    body.push(spdif as u8);
    body.push(dac as u8);
    frame(body)
}

/// Gain command; `None` leaves the volume control untouched.
pub fn audg(gain: Option<u8>) -> Vec<u8> {
    let mut body = Vec::with_capacity(24);
    body.extend_from_slice(b"audg");
    body.extend_from_slice(&0u32.to_be_bytes()); // old gain left
    body.extend_from_slice(&0u32.to_be_bytes()); // old gain right

    match gain {
        Some(gain) => {
            let gain = gain.min(100) as u32;
            let fixed = (65535 * gain / 100) as u16;
            body.push(1); // digital volume control on
            body.push(255); // preamplification level
            body.extend_from_slice(&0u16.to_be_bytes());
            body.extend_from_slice(&fixed.to_be_bytes());
            body.extend_from_slice(&0u16.to_be_bytes());
            body.extend_from_slice(&fixed.to_be_bytes());
        }
        None => {
            body.push(0);
            body.push(0);
            body.extend_from_slice(&[0u8; 8]);
        }
    }

    body.extend_from_slice(&0u16.to_be_bytes()); // sequence id
    frame(body)
}

/// Device setting query.
pub fn setd(device_id: DeviceId) -> Vec<u8> {
    let mut body = Vec::with_capacity(5);
    body.extend_from_slice(b"setd");
    body.push(device_id as u8);
    frame(body)
}

fn map_pcm_sample_size(bits_per_sample: u16) -> u8 {
    match bits_per_sample {
        8 => b'0',
        16 => b'1',
        24 => b'2',
        32 => b'3',
        _ => b'?',
    }
}

fn map_pcm_sampling_rate(sampling_rate: u32) -> u8 {
    match sampling_rate {
        8000 => b'5',
        11025 => b'0',
        12000 => b'6',
        16000 => b'7',
        22500 => b'1',
        24000 => b'8',
        32000 => b'2',
        44100 => b'3',
        48000 => b'4',
        96000 => b'9',
        _ => {
            if sampling_rate > 96000 {
                debug!("SlimProto does not support PCM sampling rates beyond 96K");
            }
            b'?'
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn helo_frame() -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(b"HELO");
        frame.extend_from_slice(&36u32.to_be_bytes());
        frame.extend_from_slice(&[0u8; 36]);
        frame
    }

    #[test]
    fn test_incomplete_frame_consumes_nothing() {
        assert!(parse_frame(b"HEL").unwrap().is_none());

        // Declared length exceeds available bytes: accumulate, zero consumed.
        let mut partial = Vec::new();
        partial.extend_from_slice(b"STAT");
        partial.extend_from_slice(&53u32.to_be_bytes());
        partial.extend_from_slice(&[0u8; 10]);
        assert!(parse_frame(&partial).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(b"HELO");
        frame.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        assert!(parse_frame(&frame).is_err());
    }

    #[test]
    fn test_helo_roundtrip() {
        let frame = helo_frame();
        let (consumed, parsed) = parse_frame(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(&parsed.opcode, b"HELO");

        let helo = parse_helo(parsed.payload).unwrap();
        assert_eq!(helo.client_id(), "00:00:00:00:00:00");
        assert_eq!(helo.bytes_received, 0);
        assert!(helo.language.is_some());
    }

    #[test]
    fn test_helo_mac_formatting() {
        let mut payload = vec![0u8; 36];
        payload[2..8].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x42]);
        let helo = parse_helo(&payload).unwrap();
        assert_eq!(helo.client_id(), "de:ad:be:ef:00:42");
    }

    #[test]
    fn test_stat_parses_event_and_timestamp() {
        let mut payload = vec![0u8; 53];
        payload[0..4].copy_from_slice(b"STMc");
        payload[47..51].copy_from_slice(&7u32.to_be_bytes()); // server timestamp
        let stat = parse_stat(&payload).unwrap();
        assert_eq!(stat.event_str(), "STMc");
        assert_eq!(stat.server_timestamp, 7);

        assert!(parse_stat(&payload[..20]).is_err());
    }

    #[test]
    fn test_dsco_reason_codes() {
        assert_eq!(
            parse_dsco(&[0]).unwrap(),
            DisconnectReason::ConnectionClosed
        );
        assert_eq!(parse_dsco(&[2]).unwrap(), DisconnectReason::Timeout);
        assert_eq!(parse_dsco(&[9]).unwrap(), DisconnectReason::Unknown(9));
        assert!(parse_dsco(&[]).is_err());
    }

    #[test]
    fn test_setd_reply_carries_name() {
        let mut payload = vec![0u8];
        payload.extend_from_slice(b"Kitchen\0");
        let (id, name) = parse_setd(&payload).unwrap();
        assert_eq!(id, 0);
        assert_eq!(name, "Kitchen");
    }

    #[test]
    fn test_outbound_frames_carry_length_prefix() {
        for command in [
            strm_stop(),
            strm_time(3),
            aude(true, true),
            audg(Some(50)),
            setd(DeviceId::RequestName),
        ] {
            let declared = u16::from_be_bytes(command[0..2].try_into().unwrap()) as usize;
            assert_eq!(declared, command.len() - 2);
        }
    }

    #[test]
    fn test_strm_stop_layout() {
        let command = strm_stop();
        assert_eq!(&command[2..6], b"strm");
        assert_eq!(command[6], b'q');
        assert_eq!(command[7], b'0');
        // Fixed body: opcode + 2 + 5 format bytes + 7 zeros + gain + port + ip.
        assert_eq!(command.len(), 2 + 28);
    }

    #[test]
    fn test_strm_time_carries_key() {
        let command = strm_time(0xA1B2C3D4);
        assert_eq!(command[6], b't');
        assert_eq!(&command[2 + 18..2 + 22], &0xA1B2C3D4u32.to_be_bytes());
    }

    #[test]
    fn test_strm_start_embeds_http_request() {
        let command = strm_start(Format::Pcm, 32, 9000, 48000, "00:11:22:33:44:55");
        assert_eq!(command[6], b's');
        assert_eq!(command[8], b'p');
        assert_eq!(command[9], b'3'); // 32-bit samples
        assert_eq!(command[10], b'4'); // 48 kHz
        let body = &command[2..];
        assert_eq!(&body[22..24], &9000u16.to_be_bytes());
        let tail = String::from_utf8_lossy(&body[28..]).into_owned();
        assert_eq!(tail, "GET /stream?player=00:11:22:33:44:55");

        let flac = strm_start(Format::Flac, 24, 9000, 96000, "x");
        assert_eq!(&flac[8..13], b"f????");
    }

    #[test]
    fn test_aude_flags() {
        let command = aude(true, false);
        assert_eq!(&command[2..6], b"aude");
        assert_eq!(command[6], 1);
        assert_eq!(command[7], 0);
    }

    #[test]
    fn test_audg_gain_scaling() {
        let command = audg(Some(100));
        let body = &command[2..];
        assert_eq!(body.len(), 24);
        assert_eq!(body[12], 1);
        assert_eq!(body[13], 255);
        let gain = u16::from_be_bytes(body[16..18].try_into().unwrap());
        assert_eq!(gain, 65535);

        let muted = audg(Some(0));
        let gain = u16::from_be_bytes(muted[2 + 16..2 + 18].try_into().unwrap());
        assert_eq!(gain, 0);
    }

    #[test]
    fn test_setd_ids() {
        assert_eq!(setd(DeviceId::RequestName)[6], 0);
        assert_eq!(setd(DeviceId::Squeezebox3)[6], 4);
    }
}
