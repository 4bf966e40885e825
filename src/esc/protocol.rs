// SmartESC serial protocol
//
// Frame format: [START, LENGTH, PAYLOAD..., CHECKSUM]
// LENGTH counts payload bytes only, so a frame is always LENGTH + 3 bytes long.
// Multi-byte values are little-endian.
//
// The checksum is additive, not a CRC: it catches single corrupted bytes but not
// reordering or compensating multi-byte errors. The ESC firmware computes it the
// same way, so it must stay bit-for-bit as is.

/// Start markers, host -> ESC
pub const START_REG_SET: u8 = 0x01;
pub const START_REG_GET: u8 = 0x02;
pub const START_CMD: u8 = 0x03;

/// Start markers, ESC -> host
pub const START_OK: u8 = 0xF0;
pub const START_ERR: u8 = 0xFF;

/// Marker + length + checksum
pub const FRAME_OVERHEAD: usize = 3;
pub const MIN_FRAME_LEN: usize = FRAME_OVERHEAD;
pub const MAX_FRAME_LEN: usize = u8::MAX as usize + FRAME_OVERHEAD;

/// Frame start marker
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMarker {
    RegSet = START_REG_SET,
    RegGet = START_REG_GET,
    Cmd = START_CMD,
    Ok = START_OK,
    Err = START_ERR,
}

impl TryFrom<u8> for StartMarker {
    type Error = FrameError;

    fn try_from(byte: u8) -> std::result::Result<Self, Self::Error> {
        match byte {
            START_REG_SET => Ok(Self::RegSet),
            START_REG_GET => Ok(Self::RegGet),
            START_CMD => Ok(Self::Cmd),
            START_OK => Ok(Self::Ok),
            START_ERR => Ok(Self::Err),
            other => Err(FrameError::UnknownMarker { marker: other }),
        }
    }
}

/// Commands understood by the ESC
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start = 0x01,
    Stop = 0x02,
    FaultAck = 0x07,
}

/// Register addresses
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    TargetMotor = 0x00,
    Status = 0x02,
    ControlMode = 0x03, // 0 = torque, 1 = speed
    Speed = 0x04,
    Torque = 0x08, // signed 16-bit
    TorqueKp = 0x09,
    TorqueKi = 0x0A,
    FluxRef = 0x0C,
    FluxKi = 0x0D,
    FluxKp = 0x0E,
    SpeedMeasured = 0x1E, // signed 32-bit, read-only
}

/// Value written by a register set; the variant picks the wire width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    I8(i8),
    I16(i16),
    U16(u16),
    I32(i32),
}

impl RegisterValue {
    fn extend_le(self, out: &mut Vec<u8>) {
        match self {
            Self::I8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
}

/// ESC motor-control state, as reported by the status register
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscState {
    Idle = 0,
    IdleAlignment = 1,
    Alignment = 2,
    IdleStart = 3,
    Start = 4,
    StartRun = 5,
    Run = 6,
    AnyStop = 7,
    Stop = 8,
    StopIdle = 9,
    FaultNow = 10,
    FaultOver = 11,
    IclWait = 12,
    AlignChargeBootCap = 13,
    AlignOffsetCalib = 14,
    AlignClear = 15,
    ChargeBootCap = 16,
    OffsetCalib = 17,
    Clear = 18,
    SwitchOver = 19,
    WaitStopMotor = 20,
}

impl EscState {
    pub fn from_byte(byte: u8) -> Option<Self> {
        use EscState::*;
        const ALL: [EscState; 21] = [
            Idle,
            IdleAlignment,
            Alignment,
            IdleStart,
            Start,
            StartRun,
            Run,
            AnyStop,
            Stop,
            StopIdle,
            FaultNow,
            FaultOver,
            IclWait,
            AlignChargeBootCap,
            AlignOffsetCalib,
            AlignClear,
            ChargeBootCap,
            OffsetCalib,
            Clear,
            SwitchOver,
            WaitStopMotor,
        ];
        ALL.get(byte as usize).copied()
    }

    pub fn is_fault(self) -> bool {
        matches!(self, EscState::FaultNow | EscState::FaultOver)
    }
}

/// Codec-level failures. All of them are recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Truncated frame: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Checksum mismatch (length {length}): computed 0x{computed:02X}, received 0x{received:02X}")]
    ChecksumMismatch {
        length: u8,
        computed: u8,
        received: u8,
    },

    #[error("Unknown start marker 0x{marker:02X}")]
    UnknownMarker { marker: u8 },
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// Sum every byte into a 16-bit accumulator, then fold the high byte onto the low one.
pub fn checksum(data: &[u8]) -> u8 {
    let sum = data
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));
    let [lo, hi] = sum.to_le_bytes();
    lo.wrapping_add(hi)
}

/// Total frame length for a declared payload length
pub fn frame_len(payload_length: u8) -> usize {
    payload_length as usize + FRAME_OVERHEAD
}

/// Payload lengths the ESC may legitimately send back
pub fn is_supported_length(payload_length: u8) -> bool {
    matches!(payload_length, 0 | 1 | 2 | 4)
}

/// One wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub marker: StartMarker,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(marker: StartMarker, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= u8::MAX as usize);
        Self { marker, payload }
    }

    pub fn payload_length(&self) -> u8 {
        self.payload.len() as u8
    }

    /// Checksum over marker, length and payload
    pub fn checksum(&self) -> u8 {
        let mut bytes = self.to_bytes();
        bytes.pop();
        checksum(&bytes)
    }

    /// Bytes on the wire, checksum included
    pub fn wire_len(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(self.wire_len());
        packet.push(self.marker as u8);
        packet.push(self.payload_length());
        packet.extend_from_slice(&self.payload);
        packet.push(checksum(&packet));
        packet
    }

    /// Parse one raw frame of any direction from the start of `bytes`.
    /// Returns the frame and the number of bytes it occupied.
    pub fn parse(bytes: &[u8]) -> Result<(Frame, usize)> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(FrameError::Truncated {
                needed: MIN_FRAME_LEN,
                available: bytes.len(),
            });
        }
        let marker = StartMarker::try_from(bytes[0])?;
        let length = bytes[1];
        let total = frame_len(length);
        verify(bytes, total)?;
        let frame = Frame::new(marker, bytes[2..total - 1].to_vec());
        Ok((frame, total))
    }
}

fn verify(bytes: &[u8], total: usize) -> Result<()> {
    if bytes.len() < total {
        return Err(FrameError::Truncated {
            needed: total,
            available: bytes.len(),
        });
    }
    let computed = checksum(&bytes[..total - 1]);
    let received = bytes[total - 1];
    if computed != received {
        return Err(FrameError::ChecksumMismatch {
            length: bytes[1],
            computed,
            received,
        });
    }
    Ok(())
}

pub fn encode_command(cmd: Command) -> Frame {
    Frame::new(StartMarker::Cmd, vec![cmd as u8])
}

pub fn encode_register_get(register: Register) -> Frame {
    Frame::new(StartMarker::RegGet, vec![register as u8])
}

pub fn encode_register_set(register: Register, value: RegisterValue) -> Frame {
    let mut payload = Vec::with_capacity(5);
    payload.push(register as u8);
    value.extend_le(&mut payload);
    Frame::new(StartMarker::RegSet, payload)
}

/// An ESC -> host frame, interpreted by payload length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedFrame {
    /// Bare acknowledgement of a command or register set
    Ack { ok: bool },
    /// Single-byte register value (the status register, in practice)
    ByteValue { ok: bool, value: u8 },
    /// Two-byte payload; the protocol defines no meaning for it
    Unknown { ok: bool },
    /// Four-byte register value (measured speed)
    Int32Value { ok: bool, value: i32 },
    /// Any other payload length
    MalformedLength { ok: bool, length: u8 },
}

impl ParsedFrame {
    pub fn ok(&self) -> bool {
        match *self {
            ParsedFrame::Ack { ok }
            | ParsedFrame::ByteValue { ok, .. }
            | ParsedFrame::Unknown { ok }
            | ParsedFrame::Int32Value { ok, .. }
            | ParsedFrame::MalformedLength { ok, .. } => ok,
        }
    }

    /// ESC state carried by an error frame, when that state is a fault
    pub fn fault_state(&self) -> Option<EscState> {
        match *self {
            ParsedFrame::ByteValue { ok: false, value } => {
                EscState::from_byte(value).filter(|s| s.is_fault())
            }
            _ => None,
        }
    }
}

/// Decode the ESC -> host frame starting at `offset`.
/// Pure: the buffer is not modified. On success returns the frame and its length.
pub fn decode_frame(buffer: &[u8], offset: usize) -> Result<(ParsedFrame, usize)> {
    let rest = buffer.get(offset..).unwrap_or(&[]);
    if rest.is_empty() {
        return Err(FrameError::Truncated {
            needed: MIN_FRAME_LEN,
            available: 0,
        });
    }

    let ok = match rest[0] {
        START_OK => true,
        START_ERR => false,
        marker => return Err(FrameError::UnknownMarker { marker }),
    };

    if rest.len() < 2 {
        return Err(FrameError::Truncated {
            needed: MIN_FRAME_LEN,
            available: rest.len(),
        });
    }
    let length = rest[1];
    let total = frame_len(length);
    verify(rest, total)?;

    let payload = &rest[2..total - 1];
    let parsed = match length {
        0 => ParsedFrame::Ack { ok },
        1 => ParsedFrame::ByteValue {
            ok,
            value: payload[0],
        },
        2 => ParsedFrame::Unknown { ok },
        4 => ParsedFrame::Int32Value {
            ok,
            value: i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
        },
        length => ParsedFrame::MalformedLength { ok, length },
    };
    Ok((parsed, total))
}

/// Hex dump used by frame tracing
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn esc_frame(marker: u8, payload: &[u8]) -> Vec<u8> {
        let marker = StartMarker::try_from(marker).unwrap();
        Frame::new(marker, payload.to_vec()).to_bytes()
    }

    #[test]
    fn test_checksum_folds_high_byte() {
        // 0xFF + 0xFF + 0x04 = 0x0202 -> 0x02 + 0x02
        assert_eq!(checksum(&[0xFF, 0xFF, 0x04]), 0x04);
        // no carry
        assert_eq!(checksum(&[0x03, 0x01, 0x02]), 0x06);
        // fold result wraps at 8 bits: 0x01FF -> 0xFF + 0x01
        assert_eq!(checksum(&[0xFF, 0xFF, 0x01]), 0x00);
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn test_encode_command() {
        let bytes = encode_command(Command::Stop).to_bytes();
        assert_eq!(bytes, vec![0x03, 0x01, 0x02, 0x06]);
    }

    #[test]
    fn test_encode_register_get() {
        let bytes = encode_register_get(Register::SpeedMeasured).to_bytes();
        assert_eq!(bytes, vec![0x02, 0x01, 0x1E, 0x21]);
    }

    #[test]
    fn test_encode_register_set_widths() {
        let s8 = encode_register_set(Register::ControlMode, RegisterValue::I8(-1));
        assert_eq!(s8.payload_length(), 2);
        assert_eq!(s8.to_bytes().len(), 5);

        let u16v = encode_register_set(Register::TorqueKp, RegisterValue::U16(200));
        assert_eq!(u16v.to_bytes()[..5], [0x01, 0x03, 0x09, 200, 0x00]);

        let torque = encode_register_set(Register::Torque, RegisterValue::I16(-100));
        assert_eq!(torque.to_bytes()[2..5], [0x08, 0x9C, 0xFF]);

        let s32 = encode_register_set(Register::Speed, RegisterValue::I32(0x0102_0304));
        assert_eq!(s32.payload_length(), 5);
        assert_eq!(s32.to_bytes()[3..7], [0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_trailing_byte_is_checksum_of_prefix() {
        let frames = [
            encode_command(Command::FaultAck),
            encode_register_get(Register::Status),
            encode_register_set(Register::Torque, RegisterValue::I16(1400)),
            encode_register_set(Register::FluxRef, RegisterValue::U16(300)),
            encode_register_set(Register::Speed, RegisterValue::I32(-5000)),
        ];
        for frame in frames {
            let bytes = frame.to_bytes();
            let (last, prefix) = bytes.split_last().unwrap();
            assert_eq!(*last, checksum(prefix));
            assert_eq!(*last, frame.checksum());
        }
    }

    #[test]
    fn test_parse_recovers_host_frames() {
        let frame = encode_register_set(Register::Torque, RegisterValue::I16(-510));
        let bytes = frame.to_bytes();
        let (parsed, used) = Frame::parse(&bytes).unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(used, bytes.len());

        let frame = encode_command(Command::Start);
        let (parsed, _) = Frame::parse(&frame.to_bytes()).unwrap();
        assert_eq!(parsed.marker, StartMarker::Cmd);
        assert_eq!(parsed.payload, vec![Command::Start as u8]);
    }

    #[test]
    fn test_decode_by_length() {
        let ack = esc_frame(START_OK, &[]);
        assert_eq!(
            decode_frame(&ack, 0).unwrap(),
            (ParsedFrame::Ack { ok: true }, 3)
        );

        let status = esc_frame(START_ERR, &[6]);
        assert_eq!(
            decode_frame(&status, 0).unwrap(),
            (ParsedFrame::ByteValue { ok: false, value: 6 }, 4)
        );

        let unknown = esc_frame(START_OK, &[1, 2]);
        assert_eq!(
            decode_frame(&unknown, 0).unwrap().0,
            ParsedFrame::Unknown { ok: true }
        );

        let speed = esc_frame(START_OK, &(-1234i32).to_le_bytes());
        assert_eq!(
            decode_frame(&speed, 0).unwrap(),
            (ParsedFrame::Int32Value { ok: true, value: -1234 }, 7)
        );

        let odd = esc_frame(START_OK, &[1, 2, 3]);
        assert_eq!(
            decode_frame(&odd, 0).unwrap(),
            (ParsedFrame::MalformedLength { ok: true, length: 3 }, 6)
        );
    }

    #[test]
    fn test_decode_at_offset() {
        let mut buf = esc_frame(START_OK, &[]);
        buf.extend(esc_frame(START_OK, &[9]));
        assert_eq!(
            decode_frame(&buf, 3).unwrap(),
            (ParsedFrame::ByteValue { ok: true, value: 9 }, 4)
        );
    }

    #[test]
    fn test_decode_truncated() {
        let speed = esc_frame(START_OK, &[1, 0, 0, 0]);
        assert_eq!(
            decode_frame(&speed[..5], 0),
            Err(FrameError::Truncated {
                needed: 7,
                available: 5
            })
        );
        assert_eq!(
            decode_frame(&speed[..1], 0),
            Err(FrameError::Truncated {
                needed: 3,
                available: 1
            })
        );
        assert!(matches!(
            decode_frame(&speed, 7),
            Err(FrameError::Truncated { available: 0, .. })
        ));
    }

    #[test]
    fn test_decode_checksum_mismatch() {
        let mut status = esc_frame(START_OK, &[6]);
        status[2] = 7;
        assert_eq!(
            decode_frame(&status, 0),
            Err(FrameError::ChecksumMismatch {
                length: 1,
                computed: checksum(&[START_OK, 1, 7]),
                received: checksum(&[START_OK, 1, 6]),
            })
        );
    }

    #[test]
    fn test_decode_rejects_host_markers() {
        let bytes = encode_command(Command::Stop).to_bytes();
        assert_eq!(
            decode_frame(&bytes, 0),
            Err(FrameError::UnknownMarker { marker: START_CMD })
        );
    }

    #[test]
    fn test_fault_state_only_on_error_frames() {
        let fault = ParsedFrame::ByteValue {
            ok: false,
            value: EscState::FaultNow as u8,
        };
        assert_eq!(fault.fault_state(), Some(EscState::FaultNow));

        let over = ParsedFrame::ByteValue {
            ok: false,
            value: EscState::FaultOver as u8,
        };
        assert_eq!(over.fault_state(), Some(EscState::FaultOver));

        let ok_fault = ParsedFrame::ByteValue {
            ok: true,
            value: EscState::FaultNow as u8,
        };
        assert_eq!(ok_fault.fault_state(), None);

        let run = ParsedFrame::ByteValue {
            ok: false,
            value: EscState::Run as u8,
        };
        assert_eq!(run.fault_state(), None);
        assert_eq!(ParsedFrame::Ack { ok: false }.fault_state(), None);
    }

    #[test]
    fn test_esc_state_from_byte() {
        assert_eq!(EscState::from_byte(0), Some(EscState::Idle));
        assert_eq!(EscState::from_byte(12), Some(EscState::IclWait));
        assert_eq!(EscState::from_byte(20), Some(EscState::WaitStopMotor));
        assert_eq!(EscState::from_byte(21), None);
        for byte in 0..=20u8 {
            assert_eq!(EscState::from_byte(byte).unwrap() as u8, byte);
        }
    }
}
