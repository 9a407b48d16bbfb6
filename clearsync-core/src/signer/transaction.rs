use crate::signer::{keccak256, Signature};
use crate::types::Address;
use primitive_types::U256;
use rlp::RlpStream;

/// Legacy (type 0) transaction with EIP-155 replay protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: U256,
    pub gas_price: U256,
    pub gas_limit: U256,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl LegacyTransaction {
    fn append_body(&self, stream: &mut RlpStream) {
        stream.append(&self.nonce);
        stream.append(&self.gas_price);
        stream.append(&self.gas_limit);
        stream.append(&self.to);
        stream.append(&self.value);
        stream.append(&self.data);
    }

    /// keccak256(rlp([nonce, gasPrice, gas, to, value, data, chainId, 0, 0]))
    pub fn signing_hash(&self) -> [u8; 32] {
        let mut stream = RlpStream::new_list(9);
        self.append_body(&mut stream);
        stream.append(&self.chain_id);
        stream.append(&0u8);
        stream.append(&0u8);
        keccak256(&stream.out())
    }

    /// Raw signed transaction for `eth_sendRawTransaction`.
    pub fn encode_signed(&self, signature: &Signature) -> Vec<u8> {
        let v = u64::from(signature.recovery_byte()) + 35 + 2 * self.chain_id;
        let mut stream = RlpStream::new_list(9);
        self.append_body(&mut stream);
        stream.append(&v);
        stream.append(&U256::from_big_endian(&signature.r));
        stream.append(&U256::from_big_endian(&signature.s));
        stream.out().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::SessionKey;
    use rlp::Rlp;

    fn sample() -> LegacyTransaction {
        LegacyTransaction {
            nonce: U256::from(9u64),
            gas_price: U256::from(20_000_000_000u64),
            gas_limit: U256::from(21_000u64),
            to: Address::repeat_byte(0x35),
            value: U256::from(1_000_000_000_000_000_000u64),
            data: Vec::new(),
            chain_id: 1,
        }
    }

    #[test]
    fn test_eip155_signing_hash() {
        // Example transaction from the EIP-155 text
        assert_eq!(
            hex::encode(sample().signing_hash()),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }

    #[test]
    fn test_signed_encoding_carries_chain_id_in_v() {
        let key = SessionKey::generate();
        let mut tx = sample();
        tx.chain_id = 8453;
        let digest = tx.signing_hash();
        let sig = key.sign_digest(&digest).unwrap();

        let raw = tx.encode_signed(&sig);
        let rlp = Rlp::new(&raw);
        assert_eq!(rlp.item_count().unwrap(), 9);
        let v: u64 = rlp.val_at(6).unwrap();
        assert!(v == 8453 * 2 + 35 || v == 8453 * 2 + 36);
        let to: Address = rlp.val_at(3).unwrap();
        assert_eq!(to, tx.to);
    }
}
