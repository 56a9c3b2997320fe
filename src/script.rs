//! Script assembler: opcode table, minimal data pushes, script numbers and
//! the standard locking/unlocking templates

use crate::error::{HarnessError, Result};
use crate::hash::hash160;
use crate::types::ByteString;

// ============================================================================
// Opcodes
// ============================================================================

pub const OP_0: u8 = 0x00;
pub const OP_FALSE: u8 = OP_0;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_TRUE: u8 = OP_1;
pub const OP_2: u8 = 0x52;
pub const OP_3: u8 = 0x53;
pub const OP_16: u8 = 0x60;
pub const OP_NOP: u8 = 0x61;
pub const OP_IF: u8 = 0x63;
pub const OP_NOTIF: u8 = 0x64;
pub const OP_ELSE: u8 = 0x67;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_VERIFY: u8 = 0x69;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_2DROP: u8 = 0x6d;
pub const OP_2DUP: u8 = 0x6e;
pub const OP_3DUP: u8 = 0x6f;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_SWAP: u8 = 0x7c;
pub const OP_CAT: u8 = 0x7e;
pub const OP_SPLIT: u8 = 0x7f;
pub const OP_SIZE: u8 = 0x82;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_ADD: u8 = 0x93;
pub const OP_SHA256: u8 = 0xa8;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_HASH256: u8 = 0xaa;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
pub const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;
pub const OP_CHECKDATASIG: u8 = 0xba;
pub const OP_CHECKDATASIGVERIFY: u8 = 0xbb;
pub const OP_REVERSEBYTES: u8 = 0xbc;

/// Small-integer opcode for `n` in 0..=16
pub fn small_int_opcode(n: u8) -> Option<u8> {
    match n {
        0 => Some(OP_0),
        1..=16 => Some(OP_1 + n - 1),
        _ => None,
    }
}

/// Value of OP_0 / OP_1NEGATE / OP_1..OP_16
pub fn decode_small_int(opcode: u8) -> Option<i64> {
    match opcode {
        OP_0 => Some(0),
        OP_1NEGATE => Some(-1),
        OP_1..=OP_16 => Some((opcode - OP_1 + 1) as i64),
        _ => None,
    }
}

pub fn opcode_name(opcode: u8) -> Option<&'static str> {
    let name = match opcode {
        OP_0 => "OP_0",
        OP_PUSHDATA1 => "OP_PUSHDATA1",
        OP_PUSHDATA2 => "OP_PUSHDATA2",
        OP_PUSHDATA4 => "OP_PUSHDATA4",
        OP_1NEGATE => "OP_1NEGATE",
        OP_NOP => "OP_NOP",
        OP_IF => "OP_IF",
        OP_NOTIF => "OP_NOTIF",
        OP_ELSE => "OP_ELSE",
        OP_ENDIF => "OP_ENDIF",
        OP_VERIFY => "OP_VERIFY",
        OP_RETURN => "OP_RETURN",
        OP_2DROP => "OP_2DROP",
        OP_2DUP => "OP_2DUP",
        OP_3DUP => "OP_3DUP",
        OP_DROP => "OP_DROP",
        OP_DUP => "OP_DUP",
        OP_SWAP => "OP_SWAP",
        OP_CAT => "OP_CAT",
        OP_SPLIT => "OP_SPLIT",
        OP_SIZE => "OP_SIZE",
        OP_EQUAL => "OP_EQUAL",
        OP_EQUALVERIFY => "OP_EQUALVERIFY",
        OP_ADD => "OP_ADD",
        OP_SHA256 => "OP_SHA256",
        OP_HASH160 => "OP_HASH160",
        OP_HASH256 => "OP_HASH256",
        OP_CHECKSIG => "OP_CHECKSIG",
        OP_CHECKSIGVERIFY => "OP_CHECKSIGVERIFY",
        OP_CHECKMULTISIG => "OP_CHECKMULTISIG",
        OP_CHECKMULTISIGVERIFY => "OP_CHECKMULTISIGVERIFY",
        OP_CHECKLOCKTIMEVERIFY => "OP_CHECKLOCKTIMEVERIFY",
        OP_CHECKSEQUENCEVERIFY => "OP_CHECKSEQUENCEVERIFY",
        OP_CHECKDATASIG => "OP_CHECKDATASIG",
        OP_CHECKDATASIGVERIFY => "OP_CHECKDATASIGVERIFY",
        OP_REVERSEBYTES => "OP_REVERSEBYTES",
        _ => return None,
    };
    Some(name)
}

// ============================================================================
// Script numbers
// ============================================================================

/// Minimal little-endian sign-magnitude encoding used for numeric pushes
pub fn encode_script_num(value: i64) -> ByteString {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let last = out.len() - 1;
    if out[last] & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        out[last] |= 0x80;
    }
    out
}

/// Inverse of [`encode_script_num`]; accepts at most 8 bytes
pub fn decode_script_num(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 8 {
        return Err(HarnessError::InvalidArgument(format!(
            "script number too long: {} bytes",
            bytes.len()
        )));
    }
    let mut value: i64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        value |= (*byte as i64) << (8 * i);
    }
    let sign_bit = 0x80i64 << (8 * (bytes.len() - 1));
    if value & sign_bit != 0 {
        Ok(-(value & !sign_bit))
    } else {
        Ok(value)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Byte-level script assembler emitting minimal push encodings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptBuilder {
    bytes: ByteString,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_opcode(mut self, opcode: u8) -> Self {
        self.bytes.push(opcode);
        self
    }

    pub fn push_opcodes(mut self, opcodes: &[u8]) -> Self {
        self.bytes.extend_from_slice(opcodes);
        self
    }

    /// Push data with the shortest encoding the interpreter accepts
    pub fn push_data(mut self, data: &[u8]) -> Self {
        match data.len() {
            0 => self.bytes.push(OP_0),
            1 if (1..=16).contains(&data[0]) => self.bytes.push(OP_1 + data[0] - 1),
            1 if data[0] == 0x81 => self.bytes.push(OP_1NEGATE),
            len @ 1..=0x4b => {
                self.bytes.push(len as u8);
                self.bytes.extend_from_slice(data);
            }
            len @ 0x4c..=0xff => {
                self.bytes.push(OP_PUSHDATA1);
                self.bytes.push(len as u8);
                self.bytes.extend_from_slice(data);
            }
            len @ 0x100..=0xffff => {
                self.bytes.push(OP_PUSHDATA2);
                self.bytes.extend_from_slice(&(len as u16).to_le_bytes());
                self.bytes.extend_from_slice(data);
            }
            len => {
                self.bytes.push(OP_PUSHDATA4);
                self.bytes.extend_from_slice(&(len as u32).to_le_bytes());
                self.bytes.extend_from_slice(data);
            }
        }
        self
    }

    pub fn push_int(self, value: i64) -> Self {
        match value {
            -1 => self.push_opcode(OP_1NEGATE),
            0 => self.push_opcode(OP_0),
            1..=16 => self.push_opcode(OP_1 + value as u8 - 1),
            _ => self.push_data(&encode_script_num(value)),
        }
    }

    /// Append raw bytes without a push prefix
    pub fn push_raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> ByteString {
        self.bytes
    }
}

/// One parsed script element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOp {
    Push(ByteString),
    Op(u8),
}

/// Split a script into pushes and opcodes; fails on truncated pushes
pub fn parse_script(script: &[u8]) -> Result<Vec<ScriptOp>> {
    let mut ops = Vec::new();
    let mut pos = 0;
    while pos < script.len() {
        let opcode = script[pos];
        pos += 1;
        let len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => read_push_len(script, &mut pos, 1)?,
            OP_PUSHDATA2 => read_push_len(script, &mut pos, 2)?,
            OP_PUSHDATA4 => read_push_len(script, &mut pos, 4)?,
            _ => {
                ops.push(ScriptOp::Op(opcode));
                continue;
            }
        };
        if pos + len > script.len() {
            return Err(HarnessError::InvalidArgument(format!(
                "push of {} bytes at offset {} runs past end of script",
                len, pos
            )));
        }
        ops.push(ScriptOp::Push(script[pos..pos + len].to_vec()));
        pos += len;
    }
    Ok(ops)
}

fn read_push_len(script: &[u8], pos: &mut usize, width: usize) -> Result<usize> {
    if *pos + width > script.len() {
        return Err(HarnessError::InvalidArgument("truncated push length".to_string()));
    }
    let mut len = 0usize;
    for i in 0..width {
        len |= (script[*pos + i] as usize) << (8 * i);
    }
    *pos += width;
    Ok(len)
}

/// True when the script contains only data pushes and small-int opcodes
pub fn is_push_only(script: &[u8]) -> bool {
    match parse_script(script) {
        Ok(ops) => ops.iter().all(|op| match op {
            ScriptOp::Push(_) => true,
            ScriptOp::Op(code) => *code <= OP_16,
        }),
        Err(_) => false,
    }
}

// ============================================================================
// Templates
// ============================================================================

/// OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG
pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> ByteString {
    ScriptBuilder::new()
        .push_opcodes(&[OP_DUP, OP_HASH160])
        .push_data(pubkey_hash)
        .push_opcodes(&[OP_EQUALVERIFY, OP_CHECKSIG])
        .into_bytes()
}

pub fn p2pkh_script_for_pubkey(pubkey: &[u8]) -> ByteString {
    p2pkh_script(&hash160(pubkey))
}

/// OP_HASH160 <hash> OP_EQUAL
pub fn p2sh_script(script_hash: &[u8; 20]) -> ByteString {
    ScriptBuilder::new()
        .push_opcode(OP_HASH160)
        .push_data(script_hash)
        .push_opcode(OP_EQUAL)
        .into_bytes()
}

/// P2SH locking script committing to `redeem_script`
pub fn p2sh_wrap(redeem_script: &[u8]) -> ByteString {
    p2sh_script(&hash160(redeem_script))
}

/// <pubkey> OP_CHECKSIG
pub fn p2pk_script(pubkey: &[u8]) -> ByteString {
    ScriptBuilder::new().push_data(pubkey).push_opcode(OP_CHECKSIG).into_bytes()
}

pub fn op_return_script(data: &[u8]) -> ByteString {
    ScriptBuilder::new().push_opcode(OP_RETURN).push_data(data).into_bytes()
}

/// <sig||hashtype> <pubkey>
pub fn signature_script_p2pkh(signature_with_hashtype: &[u8], pubkey: &[u8]) -> ByteString {
    ScriptBuilder::new().push_data(signature_with_hashtype).push_data(pubkey).into_bytes()
}

/// Extract the 20-byte hash from a P2PKH locking script
pub fn extract_p2pkh_hash(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[3..23]);
        Some(hash)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_push_boundaries() {
        assert_eq!(ScriptBuilder::new().push_data(&[]).into_bytes(), vec![OP_0]);
        assert_eq!(ScriptBuilder::new().push_data(&[5]).into_bytes(), vec![0x55]);
        assert_eq!(ScriptBuilder::new().push_data(&[0x81]).into_bytes(), vec![OP_1NEGATE]);
        assert_eq!(ScriptBuilder::new().push_data(&[0x00]).into_bytes(), vec![0x01, 0x00]);
        assert_eq!(ScriptBuilder::new().push_data(&[0x11]).into_bytes(), vec![0x01, 0x11]);

        let s75 = ScriptBuilder::new().push_data(&[0xaa; 75]).into_bytes();
        assert_eq!(s75[0], 75);
        assert_eq!(s75.len(), 76);

        let s76 = ScriptBuilder::new().push_data(&[0xaa; 76]).into_bytes();
        assert_eq!(&s76[..2], &[OP_PUSHDATA1, 76]);

        let s256 = ScriptBuilder::new().push_data(&[0xaa; 256]).into_bytes();
        assert_eq!(&s256[..3], &[OP_PUSHDATA2, 0x00, 0x01]);

        let s65536 = ScriptBuilder::new().push_data(&vec![0xaa; 65536]).into_bytes();
        assert_eq!(&s65536[..5], &[OP_PUSHDATA4, 0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_script_num_encoding() {
        assert_eq!(encode_script_num(0), Vec::<u8>::new());
        assert_eq!(encode_script_num(1), vec![0x01]);
        assert_eq!(encode_script_num(-1), vec![0x81]);
        assert_eq!(encode_script_num(127), vec![0x7f]);
        assert_eq!(encode_script_num(128), vec![0x80, 0x00]);
        assert_eq!(encode_script_num(-128), vec![0x80, 0x80]);
        assert_eq!(encode_script_num(255), vec![0xff, 0x00]);
        assert_eq!(encode_script_num(256), vec![0x00, 0x01]);
        for v in [0i64, 1, -1, 127, 128, -128, 500, -70000, 1 << 40] {
            assert_eq!(decode_script_num(&encode_script_num(v)).unwrap(), v);
        }
    }

    #[test]
    fn test_push_int_uses_small_opcodes() {
        assert_eq!(ScriptBuilder::new().push_int(-1).into_bytes(), vec![OP_1NEGATE]);
        assert_eq!(ScriptBuilder::new().push_int(0).into_bytes(), vec![OP_0]);
        assert_eq!(ScriptBuilder::new().push_int(16).into_bytes(), vec![OP_16]);
        assert_eq!(ScriptBuilder::new().push_int(17).into_bytes(), vec![0x01, 0x11]);
        assert_eq!(ScriptBuilder::new().push_int(200).into_bytes(), vec![0x02, 0xc8, 0x00]);
    }

    #[test]
    fn test_p2pkh_template() {
        let hash = [0x42u8; 20];
        let script = p2pkh_script(&hash);
        assert_eq!(script.len(), 25);
        assert_eq!(extract_p2pkh_hash(&script), Some(hash));
        assert_eq!(extract_p2pkh_hash(&p2sh_script(&hash)), None);
    }

    #[test]
    fn test_p2sh_wrap_commits_to_redeem_script() {
        let redeem = vec![OP_1, OP_CHECKSIG];
        let script = p2sh_wrap(&redeem);
        assert_eq!(script.len(), 23);
        assert_eq!(&script[2..22], &hash160(&redeem));
    }

    #[test]
    fn test_parse_script() {
        let script = ScriptBuilder::new()
            .push_opcode(OP_DUP)
            .push_data(&[1, 2, 3])
            .push_data(&[0xcc; 80])
            .push_opcode(OP_CHECKDATASIG)
            .into_bytes();
        let ops = parse_script(&script).unwrap();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0], ScriptOp::Op(OP_DUP));
        assert_eq!(ops[1], ScriptOp::Push(vec![1, 2, 3]));
        assert_eq!(ops[2], ScriptOp::Push(vec![0xcc; 80]));
        assert_eq!(ops[3], ScriptOp::Op(OP_CHECKDATASIG));
    }

    #[test]
    fn test_parse_truncated_push() {
        assert!(parse_script(&[0x05, 0x01]).is_err());
        assert!(parse_script(&[OP_PUSHDATA2, 0x01]).is_err());
    }

    #[test]
    fn test_push_only() {
        let sig_script = signature_script_p2pkh(&[0x30; 71], &[0x02; 33]);
        assert!(is_push_only(&sig_script));
        assert!(!is_push_only(&[OP_DUP]));
    }

    #[test]
    fn test_opcode_names() {
        assert_eq!(opcode_name(OP_REVERSEBYTES), Some("OP_REVERSEBYTES"));
        assert_eq!(opcode_name(OP_CHECKSEQUENCEVERIFY), Some("OP_CHECKSEQUENCEVERIFY"));
        assert_eq!(small_int_opcode(3), Some(OP_3));
        assert_eq!(decode_small_int(OP_16), Some(16));
        assert_eq!(small_int_opcode(17), None);
    }
}
