use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use cannon_primitives::Hash;

use crate::{
    memory::{JsonPage, Memory},
    Arch,
};

use super::{state_hash, BinaryReader, BinaryWriter, CpuScalars, StateError};

/// Size of the single-threaded state witness.
pub const SINGLE_THREADED_WITNESS_SIZE: usize = 226;

/// State of the legacy single-threaded 32-bit VM.
#[derive(Debug, Clone)]
pub struct SingleThreadedState {
    pub memory: Memory,
    pub preimage_key: Hash,
    /// Offset into the length-prefixed preimage.
    pub preimage_offset: u64,
    pub cpu: CpuScalars,
    pub heap: u64,
    pub exit_code: u8,
    pub exited: bool,
    pub step: u64,
    pub registers: [u64; 32],
    /// Buffered bytes of an incomplete hint.
    pub last_hint: Vec<u8>,
}

impl SingleThreadedState {
    pub const ARCH: Arch = Arch::Mips32;

    /// Fresh state starting at `pc` with the heap pointer at `heap_start`.
    #[must_use]
    pub fn new(pc: u64, heap_start: u64) -> Self {
        Self {
            memory: Memory::new(Self::ARCH),
            preimage_key: [0; 32],
            preimage_offset: 0,
            cpu: CpuScalars { pc, next_pc: Self::ARCH.mask(pc + 4), lo: 0, hi: 0 },
            heap: heap_start,
            exit_code: 0,
            exited: false,
            step: 0,
            registers: [0; 32],
            last_hint: Vec::new(),
        }
    }

    /// Witness of the state: everything but memory, which is folded into its root.
    pub fn encode_witness(&mut self) -> (Vec<u8>, Hash) {
        let mut out = Vec::with_capacity(SINGLE_THREADED_WITNESS_SIZE);
        out.extend_from_slice(&self.memory.merkle_root());
        out.extend_from_slice(&self.preimage_key);
        let mut w = BinaryWriter::new(Self::ARCH, &mut out);
        let _ = self.encode_scalars(&mut w);
        let hash = state_hash(&out, self.exited, self.exit_code);
        (out, hash)
    }

    fn encode_scalars<W: Write>(&self, w: &mut BinaryWriter<'_, W>) -> std::io::Result<()> {
        w.word(self.preimage_offset)?;
        w.word(self.cpu.pc)?;
        w.word(self.cpu.next_pc)?;
        w.word(self.cpu.lo)?;
        w.word(self.cpu.hi)?;
        w.word(self.heap)?;
        w.u8(self.exit_code)?;
        w.bool(self.exited)?;
        w.u64(self.step)?;
        for reg in self.registers {
            w.word(reg)?;
        }
        Ok(())
    }

    /// Binary encoding, without the version byte.
    pub fn serialize<W: Write>(&self, out: &mut W) -> Result<(), StateError> {
        self.memory.serialize(out)?;
        let mut w = BinaryWriter::new(Self::ARCH, out);
        w.hash(&self.preimage_key)?;
        self.encode_scalars(&mut w)?;
        w.bytes(&self.last_hint)?;
        Ok(())
    }

    pub fn deserialize<R: Read>(input: &mut R) -> Result<Self, StateError> {
        let memory = Memory::deserialize(Self::ARCH, input)?;
        let mut r = BinaryReader::new(Self::ARCH, input);
        let preimage_key = r.hash()?;
        let preimage_offset = r.word()?;
        let cpu = CpuScalars { pc: r.word()?, next_pc: r.word()?, lo: r.word()?, hi: r.word()? };
        let heap = r.word()?;
        let exit_code = r.u8()?;
        let exited = r.bool()?;
        let step = r.u64()?;
        let mut registers = [0u64; 32];
        for reg in &mut registers {
            *reg = r.word()?;
        }
        let last_hint = r.bytes()?;
        Ok(Self {
            memory,
            preimage_key,
            preimage_offset,
            cpu,
            heap,
            exit_code,
            exited,
            step,
            registers,
            last_hint,
        })
    }

    /// The legacy JSON encoding.
    pub fn to_json(&self) -> Result<String, StateError> {
        let json = JsonState {
            memory: self.memory.to_json_pages(),
            preimage_key: format!("0x{}", hex::encode(self.preimage_key)),
            preimage_offset: self.preimage_offset,
            pc: self.cpu.pc,
            next_pc: self.cpu.next_pc,
            lo: self.cpu.lo,
            hi: self.cpu.hi,
            heap: self.heap,
            exit: self.exit_code,
            exited: self.exited,
            step: self.step,
            registers: self.registers,
            last_hint: (!self.last_hint.is_empty())
                .then(|| format!("0x{}", hex::encode(&self.last_hint))),
        };
        Ok(serde_json::to_string(&json)?)
    }

    pub fn from_json(json: &str) -> Result<Self, StateError> {
        let json: JsonState = serde_json::from_str(json)?;
        let preimage_key = decode_hex(&json.preimage_key)?
            .try_into()
            .map_err(|_| StateError::Malformed("preimage key must be 32 bytes".to_string()))?;
        let last_hint = match &json.last_hint {
            Some(hint) => decode_hex(hint)?,
            None => Vec::new(),
        };
        let registers = json.registers.map(|reg| Self::ARCH.mask(reg));
        Ok(Self {
            memory: Memory::from_json_pages(Self::ARCH, json.memory)?,
            preimage_key,
            preimage_offset: json.preimage_offset,
            cpu: CpuScalars { pc: json.pc, next_pc: json.next_pc, lo: json.lo, hi: json.hi },
            heap: json.heap,
            exit_code: json.exit,
            exited: json.exited,
            step: json.step,
            registers,
            last_hint,
        })
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, StateError> {
    hex::decode(s.trim_start_matches("0x")).map_err(|e| StateError::Malformed(e.to_string()))
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonState {
    memory: Vec<JsonPage>,
    preimage_key: String,
    preimage_offset: u64,
    pc: u64,
    #[serde(rename = "nextPC")]
    next_pc: u64,
    lo: u64,
    hi: u64,
    heap: u64,
    exit: u8,
    exited: bool,
    step: u64,
    registers: [u64; 32],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_hint: Option<String>,
}
