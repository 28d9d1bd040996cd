//! Canonical binary encoding for consensus-hashed structures.
//!
//! All multi-byte integers are big-endian. Variable-length integers use
//! unsigned LEB128. Transactions are encoded as a field map with stable,
//! strictly ascending tag ids so that every implementation produces
//! byte-identical output for the same logical transaction.

use crate::{Block, BlockHeader, Transaction, TxOutput};

const TAG_SENDER: u64 = 1;
const TAG_OUTPUTS: u64 = 2;
const TAG_FEE: u64 = 3;
const TAG_MEMO: u64 = 4;
const TAG_TIMESTAMP: u64 = 5;
const TAG_NONCE: u64 = 6;
const TAG_SIGNATURE: u64 = 7;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of input at byte {0}")]
    Eof(usize),
    #[error("varint overflow")]
    VarintOverflow,
    #[error("non-canonical field order (tag {0})")]
    FieldOrder(u64),
    #[error("unknown field tag {0}")]
    UnknownTag(u64),
    #[error("invalid utf-8 in string field")]
    Utf8,
    #[error("trailing bytes after decode")]
    Trailing,
}

pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.data.len() {
            return Err(CodecError::Eof(self.pos));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn varint(&mut self) -> Result<u64, CodecError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or(CodecError::Eof(self.pos))?;
            self.pos += 1;
            if shift == 63 && byte > 1 {
                return Err(CodecError::VarintOverflow);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(CodecError::VarintOverflow);
            }
        }
    }

    fn u64_be(&mut self) -> Result<u64, CodecError> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().expect("8 bytes")))
    }

    fn u32_be(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("4 bytes")))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.varint()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::Utf8)
    }

    fn byte_vec(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.varint()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn done(&self) -> bool {
        self.pos == self.data.len()
    }
}

/// Field-map transaction encoding. Absent optional fields (memo, signature)
/// are omitted entirely rather than encoded empty.
pub fn encode_tx(tx: &Transaction) -> Vec<u8> {
    let mut fields = 5usize; // sender, outputs, fee, timestamp, nonce
    if tx.memo.is_some() {
        fields += 1;
    }
    if !tx.signature.is_empty() {
        fields += 1;
    }
    let mut buf = Vec::with_capacity(64 + tx.outputs.len() * 24);
    put_varint(&mut buf, fields as u64);
    put_varint(&mut buf, TAG_SENDER);
    put_str(&mut buf, &tx.sender);
    put_varint(&mut buf, TAG_OUTPUTS);
    put_varint(&mut buf, tx.outputs.len() as u64);
    for out in &tx.outputs {
        put_str(&mut buf, &out.to);
        buf.extend_from_slice(&out.amount.to_be_bytes());
    }
    put_varint(&mut buf, TAG_FEE);
    buf.extend_from_slice(&tx.fee.to_be_bytes());
    if let Some(memo) = &tx.memo {
        put_varint(&mut buf, TAG_MEMO);
        put_str(&mut buf, memo);
    }
    put_varint(&mut buf, TAG_TIMESTAMP);
    buf.extend_from_slice(&tx.timestamp.to_be_bytes());
    put_varint(&mut buf, TAG_NONCE);
    buf.extend_from_slice(&tx.nonce.to_be_bytes());
    if !tx.signature.is_empty() {
        put_varint(&mut buf, TAG_SIGNATURE);
        put_bytes(&mut buf, &tx.signature);
    }
    buf
}

fn decode_tx_from(reader: &mut Reader<'_>) -> Result<Transaction, CodecError> {
    let field_count = reader.varint()?;
    let mut tx = Transaction {
        sender: String::new(),
        outputs: Vec::new(),
        fee: 0,
        memo: None,
        timestamp: 0,
        nonce: 0,
        signature: Vec::new(),
    };
    let mut last_tag = 0u64;
    for _ in 0..field_count {
        let tag = reader.varint()?;
        if tag <= last_tag {
            return Err(CodecError::FieldOrder(tag));
        }
        last_tag = tag;
        match tag {
            TAG_SENDER => tx.sender = reader.string()?,
            TAG_OUTPUTS => {
                let count = reader.varint()? as usize;
                let mut outputs = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let to = reader.string()?;
                    let amount = reader.u64_be()?;
                    outputs.push(TxOutput { to, amount });
                }
                tx.outputs = outputs;
            }
            TAG_FEE => tx.fee = reader.u64_be()?,
            TAG_MEMO => tx.memo = Some(reader.string()?),
            TAG_TIMESTAMP => tx.timestamp = reader.u64_be()?,
            TAG_NONCE => tx.nonce = reader.u64_be()?,
            TAG_SIGNATURE => tx.signature = reader.byte_vec()?,
            other => return Err(CodecError::UnknownTag(other)),
        }
    }
    Ok(tx)
}

pub fn decode_tx(data: &[u8]) -> Result<Transaction, CodecError> {
    let mut reader = Reader::new(data);
    let tx = decode_tx_from(&mut reader)?;
    if !reader.done() {
        return Err(CodecError::Trailing);
    }
    Ok(tx)
}

/// Fixed 88-byte header layout: version(4) | prev_hash(32) | merkle_root(32)
/// | timestamp(8) | bits(4) | nonce(8).
pub fn encode_header(header: &BlockHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(88);
    buf.extend_from_slice(&header.version.to_be_bytes());
    buf.extend_from_slice(&header.prev_hash);
    buf.extend_from_slice(&header.merkle_root);
    buf.extend_from_slice(&header.timestamp.to_be_bytes());
    buf.extend_from_slice(&header.bits.to_be_bytes());
    buf.extend_from_slice(&header.nonce.to_be_bytes());
    buf
}

pub fn decode_header(data: &[u8]) -> Result<BlockHeader, CodecError> {
    let mut reader = Reader::new(data);
    let version = reader.u32_be()?;
    let prev_hash: [u8; 32] = reader.take(32)?.try_into().expect("32 bytes");
    let merkle_root: [u8; 32] = reader.take(32)?.try_into().expect("32 bytes");
    let timestamp = reader.u64_be()?;
    let bits = reader.u32_be()?;
    let nonce = reader.u64_be()?;
    Ok(BlockHeader {
        version,
        prev_hash,
        merkle_root,
        timestamp,
        bits,
        nonce,
    })
}

/// Block file encoding: 88-byte header, varint tx count, transactions in
/// order. The height lives in the file name, not the payload.
pub fn encode_block(block: &Block) -> Vec<u8> {
    let mut buf = encode_header(&block.header);
    put_varint(&mut buf, block.transactions.len() as u64);
    for tx in &block.transactions {
        buf.extend_from_slice(&encode_tx(tx));
    }
    buf
}

pub fn decode_block(data: &[u8], height: u64) -> Result<Block, CodecError> {
    let mut reader = Reader::new(data);
    let header_bytes = reader.take(88)?;
    let header = decode_header(header_bytes)?;
    let count = reader.varint()? as usize;
    let mut transactions = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        transactions.push(decode_tx_from(&mut reader)?);
    }
    if !reader.done() {
        return Err(CodecError::Trailing);
    }
    Ok(Block {
        height,
        header,
        transactions,
    })
}
