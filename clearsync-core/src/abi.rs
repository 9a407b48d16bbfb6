//! Minimal Solidity ABI codec for the custody contract surface.
//!
//! Covers the types the contract uses: `address`, `uint*`, `bytesN`,
//! `bytes`, dynamic arrays and tuples.

use crate::error::{ClearsyncError, Result};
use crate::types::Address;
use primitive_types::U256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Uint(U256),
    FixedBytes(Vec<u8>),
    Bytes(Vec<u8>),
    Array(Vec<Token>),
    Tuple(Vec<Token>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Address,
    Uint,
    FixedBytes(usize),
    Bytes,
    Array(Box<ParamType>),
    Tuple(Vec<ParamType>),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        match self {
            Token::Bytes(_) | Token::Array(_) => true,
            Token::Tuple(items) => items.iter().any(Token::is_dynamic),
            _ => false,
        }
    }

    pub fn into_address(self) -> Result<Address> {
        match self {
            Token::Address(a) => Ok(a),
            other => Err(unexpected("address", &other)),
        }
    }

    pub fn into_uint(self) -> Result<U256> {
        match self {
            Token::Uint(v) => Ok(v),
            other => Err(unexpected("uint", &other)),
        }
    }

    pub fn into_fixed_bytes(self) -> Result<Vec<u8>> {
        match self {
            Token::FixedBytes(b) => Ok(b),
            other => Err(unexpected("bytesN", &other)),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Token::Bytes(b) => Ok(b),
            other => Err(unexpected("bytes", &other)),
        }
    }

    pub fn into_array(self) -> Result<Vec<Token>> {
        match self {
            Token::Array(items) => Ok(items),
            other => Err(unexpected("array", &other)),
        }
    }

    pub fn into_tuple(self) -> Result<Vec<Token>> {
        match self {
            Token::Tuple(items) => Ok(items),
            other => Err(unexpected("tuple", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Token) -> ClearsyncError {
    ClearsyncError::rpc(format!("ABI: expected {}, got {:?}", expected, got))
}

impl ParamType {
    fn is_dynamic(&self) -> bool {
        match self {
            ParamType::Bytes | ParamType::Array(_) => true,
            ParamType::Tuple(items) => items.iter().any(ParamType::is_dynamic),
            _ => false,
        }
    }

    fn static_size(&self) -> usize {
        match self {
            ParamType::Tuple(items) => items.iter().map(ParamType::static_size).sum(),
            _ => 32,
        }
    }
}

/// First four bytes of keccak256 of the canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = crate::signer::keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// `abi.encode(tokens...)`
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    encode_tuple(tokens)
}

/// Calldata: selector followed by the encoded arguments.
pub fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend(encode(args));
    data
}

fn word_from_usize(value: usize) -> [u8; 32] {
    let mut word = [0u8; 32];
    U256::from(value).to_big_endian(&mut word);
    word
}

fn pad_right(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    let rem = out.len() % 32;
    if rem != 0 {
        out.resize(out.len() + 32 - rem, 0);
    }
    out
}

fn encode_tuple(tokens: &[Token]) -> Vec<u8> {
    let encoded: Vec<Vec<u8>> = tokens.iter().map(encode_token).collect();
    let head_len: usize = tokens
        .iter()
        .zip(&encoded)
        .map(|(t, e)| if t.is_dynamic() { 32 } else { e.len() })
        .sum();

    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();
    for (token, bytes) in tokens.iter().zip(encoded) {
        if token.is_dynamic() {
            head.extend_from_slice(&word_from_usize(head_len + tail.len()));
            tail.extend(bytes);
        } else {
            head.extend(bytes);
        }
    }
    head.extend(tail);
    head
}

fn encode_token(token: &Token) -> Vec<u8> {
    match token {
        Token::Address(address) => {
            let mut word = vec![0u8; 12];
            word.extend_from_slice(address.as_bytes());
            word
        }
        Token::Uint(value) => {
            let mut word = vec![0u8; 32];
            value.to_big_endian(&mut word);
            word
        }
        Token::FixedBytes(bytes) => {
            let mut word = bytes.clone();
            word.resize(32, 0);
            word
        }
        Token::Bytes(bytes) => {
            let mut out = word_from_usize(bytes.len()).to_vec();
            out.extend(pad_right(bytes));
            out
        }
        Token::Array(items) => {
            let mut out = word_from_usize(items.len()).to_vec();
            out.extend(encode_tuple(items));
            out
        }
        Token::Tuple(items) => encode_tuple(items),
    }
}

/// Decode return data laid out as a tuple of `types`.
pub fn decode(types: &[ParamType], data: &[u8]) -> Result<Vec<Token>> {
    decode_tuple(types, data, 0)
}

fn read_word(data: &[u8], at: usize) -> Result<&[u8]> {
    data.get(at..at + 32)
        .ok_or_else(|| ClearsyncError::rpc(format!("ABI: data too short at offset {}", at)))
}

fn read_usize(data: &[u8], at: usize) -> Result<usize> {
    let value = U256::from_big_endian(read_word(data, at)?);
    if value > U256::from(data.len()) {
        return Err(ClearsyncError::rpc(format!(
            "ABI: offset or length {} exceeds data",
            value
        )));
    }
    Ok(value.as_usize())
}

fn decode_tuple(types: &[ParamType], data: &[u8], base: usize) -> Result<Vec<Token>> {
    let mut offset = base;
    let mut tokens = Vec::with_capacity(types.len());
    for ty in types {
        if ty.is_dynamic() {
            let pointer = read_usize(data, offset)?;
            tokens.push(decode_param(ty, data, base + pointer)?);
            offset += 32;
        } else {
            tokens.push(decode_param(ty, data, offset)?);
            offset += ty.static_size();
        }
    }
    Ok(tokens)
}

fn decode_param(ty: &ParamType, data: &[u8], at: usize) -> Result<Token> {
    match ty {
        ParamType::Address => {
            let word = read_word(data, at)?;
            Ok(Token::Address(Address::from_slice(&word[12..])))
        }
        ParamType::Uint => Ok(Token::Uint(U256::from_big_endian(read_word(data, at)?))),
        ParamType::FixedBytes(len) => {
            let word = read_word(data, at)?;
            Ok(Token::FixedBytes(word[..*len].to_vec()))
        }
        ParamType::Bytes => {
            let len = read_usize(data, at)?;
            let bytes = data
                .get(at + 32..at + 32 + len)
                .ok_or_else(|| ClearsyncError::rpc("ABI: bytes out of range"))?;
            Ok(Token::Bytes(bytes.to_vec()))
        }
        ParamType::Array(inner) => {
            let len = read_usize(data, at)?;
            let types = vec![(**inner).clone(); len];
            Ok(Token::Array(decode_tuple(&types, data, at + 32)?))
        }
        ParamType::Tuple(items) => Ok(Token::Tuple(decode_tuple(items, data, at)?)),
    }
}
