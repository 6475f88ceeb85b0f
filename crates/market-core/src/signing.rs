//! EIP-712 order signing for the exchange's matching engine.
//!
//! The exchange settles on-chain, so every order carries a typed-data
//! signature over the settlement contract's `Order` struct, and the
//! derived-credentials handshake is authenticated with a signed attestation
//! from the same key.

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolValue;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::types::{Side, SignatureMode};
use crate::{Error, Result};

/// Quote currency and share amounts are submitted in 1e6 base units.
const BASE_UNITS: u32 = 6;

/// EIP-712 domain of the settlement exchange contract.
#[derive(Debug, Clone)]
pub struct ExchangeDomain {
    pub name: &'static str,
    pub version: &'static str,
    pub chain_id: u64,
    pub verifying_contract: Address,
}

impl ExchangeDomain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            name: "Polymarket CTF Exchange",
            version: "1",
            chain_id,
            // CTF Exchange settlement contract on Polygon.
            verifying_contract: Address::from_str("0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E")
                .expect("static contract address"),
        }
    }

    /// `keccak256(encode(EIP712Domain))` used as the signing-hash prefix.
    fn separator(&self) -> B256 {
        let type_hash = keccak256(
            b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
        );
        let encoded = (
            type_hash,
            keccak256(self.name.as_bytes()),
            keccak256(self.version.as_bytes()),
            U256::from(self.chain_id),
            B256::left_padding_from(self.verifying_contract.as_slice()),
        )
            .abi_encode_packed();
        keccak256(&encoded)
    }
}

/// Raw order fields matching the settlement contract's `Order` struct.
#[derive(Debug, Clone)]
pub struct OrderData {
    pub salt: U256,
    /// Account that custodies the funds (may differ from the signer).
    pub maker: Address,
    /// Key that signs the order.
    pub signer: Address,
    pub taker: Address,
    pub token_id: U256,
    pub maker_amount: U256,
    pub taker_amount: U256,
    pub expiration: U256,
    pub nonce: U256,
    pub fee_rate_bps: U256,
    pub side: u8,
    pub signature_type: u8,
}

impl OrderData {
    /// EIP-712 struct hash. Addresses are left-padded to 32 bytes per the
    /// encodeData rules.
    fn struct_hash(&self) -> B256 {
        let type_hash = keccak256(
            b"Order(uint256 salt,address maker,address signer,address taker,uint256 tokenId,uint256 makerAmount,uint256 takerAmount,uint256 expiration,uint256 nonce,uint256 feeRateBps,uint8 side,uint8 signatureType)",
        );
        let encoded = (
            type_hash,
            self.salt,
            B256::left_padding_from(self.maker.as_slice()),
            B256::left_padding_from(self.signer.as_slice()),
            B256::left_padding_from(self.taker.as_slice()),
            self.token_id,
            self.maker_amount,
            self.taker_amount,
            self.expiration,
            self.nonce,
            self.fee_rate_bps,
            U256::from(self.side),
            U256::from(self.signature_type),
        )
            .abi_encode_packed();
        keccak256(&encoded)
    }
}

/// A signed order in the wire shape the matching engine expects: numeric
/// fields as strings, side as "BUY"/"SELL".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedOrder {
    /// Salt must serialize as a JSON number within the 2^53-1 safe range.
    pub salt: u64,
    pub maker: String,
    pub signer: String,
    pub taker: String,
    #[serde(rename = "tokenId")]
    pub token_id: String,
    #[serde(rename = "makerAmount")]
    pub maker_amount: String,
    #[serde(rename = "takerAmount")]
    pub taker_amount: String,
    pub expiration: String,
    pub nonce: String,
    #[serde(rename = "feeRateBps")]
    pub fee_rate_bps: String,
    pub side: String,
    #[serde(rename = "signatureType")]
    pub signature_type: u8,
    pub signature: String,
}

/// Signing handle bound to one user's decrypted key.
///
/// Owned exclusively by that user's session; dropped when the session locks
/// or expires.
#[derive(Clone)]
pub struct OrderSigner {
    signer: PrivateKeySigner,
    domain: ExchangeDomain,
    /// Funder address for proxy signature modes; the signer's own address
    /// for direct accounts.
    funder: Address,
    mode: SignatureMode,
}

impl OrderSigner {
    /// Build a signer from a raw hex private key.
    ///
    /// `funder` is the account that custodies funds; pass `None` when the
    /// signing key owns the funds directly.
    pub fn from_private_key(
        key: &str,
        funder: Option<&str>,
        mode: SignatureMode,
        chain_id: u64,
    ) -> Result<Self> {
        let key_clean = key.trim().trim_start_matches("0x");
        let signer = PrivateKeySigner::from_str(key_clean).map_err(|e| Error::Signing {
            message: format!("invalid private key: {e}"),
        })?;
        let funder = match funder {
            Some(addr) if !addr.is_empty() => {
                Address::from_str(addr).map_err(|e| Error::Signing {
                    message: format!("invalid funder address: {e}"),
                })?
            }
            _ => signer.address(),
        };
        Ok(Self {
            signer,
            domain: ExchangeDomain::new(chain_id),
            funder,
            mode,
        })
    }

    /// Address of the signing key.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Address that custodies funds and positions.
    pub fn funder(&self) -> Address {
        self.funder
    }

    /// Build and sign an order at `price` for `size` shares.
    pub async fn sign_order(
        &self,
        token_id: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
        fee_rate_bps: u64,
    ) -> Result<SignedOrder> {
        let token = U256::from_str(token_id).map_err(|_| Error::Order {
            message: format!("instrument id is not numeric: {token_id}"),
        })?;

        let quote = to_base_units(price * size)?;
        let shares = to_base_units(size)?;
        // A buy gives quote currency for shares; a sell gives shares for
        // quote currency.
        let (maker_amount, taker_amount, side_u8) = match side {
            Side::Buy => (quote, shares, 0u8),
            Side::Sell => (shares, quote, 1u8),
        };

        let order = OrderData {
            salt: U256::from(rand_salt()),
            maker: self.funder,
            signer: self.signer.address(),
            taker: Address::ZERO,
            token_id: token,
            maker_amount: U256::from(maker_amount),
            taker_amount: U256::from(taker_amount),
            expiration: U256::ZERO,
            nonce: U256::ZERO,
            fee_rate_bps: U256::from(fee_rate_bps),
            side: side_u8,
            signature_type: self.mode.as_u8(),
        };

        let digest = typed_data_hash(self.domain.separator(), order.struct_hash());
        let signature = self
            .signer
            .sign_hash(&digest)
            .await
            .map_err(|e| Error::Signing {
                message: format!("order signing failed: {e}"),
            })?;

        Ok(SignedOrder {
            salt: order.salt.to::<u64>(),
            maker: format!("{}", order.maker),
            signer: format!("{}", order.signer),
            taker: format!("{}", order.taker),
            token_id: order.token_id.to_string(),
            maker_amount: order.maker_amount.to_string(),
            taker_amount: order.taker_amount.to_string(),
            expiration: order.expiration.to_string(),
            nonce: order.nonce.to_string(),
            fee_rate_bps: order.fee_rate_bps.to_string(),
            side: match side {
                Side::Buy => "BUY".to_string(),
                Side::Sell => "SELL".to_string(),
            },
            signature_type: order.signature_type,
            signature: format!("0x{}", hex::encode(signature.as_bytes())),
        })
    }

    /// Sign the attestation used by the derived-credentials handshake.
    ///
    /// Matches the exchange's `ClobAuth` typed struct:
    /// `ClobAuth(address address, string timestamp, uint256 nonce, string message)`.
    pub async fn sign_auth_attestation(&self, timestamp: u64, nonce: u64) -> Result<String> {
        const ATTESTATION: &str = "This message attests that I control the given wallet";

        let auth_domain = ExchangeDomain {
            name: "ClobAuthDomain",
            version: "1",
            chain_id: self.domain.chain_id,
            verifying_contract: Address::ZERO,
        };
        // The auth domain has no verifying contract.
        let domain_type_hash =
            keccak256(b"EIP712Domain(string name,string version,uint256 chainId)");
        let separator = keccak256(
            (
                domain_type_hash,
                keccak256(auth_domain.name.as_bytes()),
                keccak256(auth_domain.version.as_bytes()),
                U256::from(auth_domain.chain_id),
            )
                .abi_encode_packed(),
        );

        let type_hash = keccak256(
            b"ClobAuth(address address,string timestamp,uint256 nonce,string message)",
        );
        let struct_hash = keccak256(
            (
                type_hash,
                B256::left_padding_from(self.signer.address().as_slice()),
                keccak256(timestamp.to_string().as_bytes()),
                U256::from(nonce),
                keccak256(ATTESTATION.as_bytes()),
            )
                .abi_encode_packed(),
        );

        let digest = typed_data_hash(separator, struct_hash);
        let signature = self
            .signer
            .sign_hash(&digest)
            .await
            .map_err(|e| Error::Signing {
                message: format!("auth attestation signing failed: {e}"),
            })?;
        Ok(format!("0x{}", hex::encode(signature.as_bytes())))
    }
}

impl std::fmt::Debug for OrderSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the private key in debug output.
        f.debug_struct("OrderSigner")
            .field("address", &format!("{}", self.address()))
            .field("funder", &format!("{}", self.funder))
            .field("mode", &self.mode)
            .finish()
    }
}

/// `keccak256("\x19\x01" ++ domainSeparator ++ structHash)`.
fn typed_data_hash(domain_separator: B256, struct_hash: B256) -> B256 {
    let prefix = [0x19u8, 0x01];
    keccak256((prefix, domain_separator, struct_hash).abi_encode_packed())
}

/// Convert a decimal amount to 1e6 base units, rejecting negatives.
fn to_base_units(amount: Decimal) -> Result<u64> {
    let scaled = amount * Decimal::from(10u64.pow(BASE_UNITS));
    scaled.round().to_u64().ok_or_else(|| Error::Order {
        message: format!("amount out of range: {amount}"),
    })
}

/// Random salt masked to the 2^53-1 safe-integer range the matching engine
/// requires for JSON numbers.
fn rand_salt() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch")
        .as_nanos();
    let raw = (nanos ^ ((std::process::id() as u128) << 32)) as u64;
    raw & ((1u64 << 53) - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // Well-known test key; never funds anything real.
    const TEST_PRIVATE_KEY: &str =
        "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const TEST_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    fn test_signer() -> OrderSigner {
        OrderSigner::from_private_key(TEST_PRIVATE_KEY, None, SignatureMode::Eoa, 137).unwrap()
    }

    #[test]
    fn signer_address_matches_key() {
        let signer = test_signer();
        assert_eq!(
            signer.address().to_string().to_lowercase(),
            TEST_ADDRESS.to_lowercase()
        );
        // No funder given: the key custodies its own funds.
        assert_eq!(signer.funder(), signer.address());
    }

    #[test]
    fn funder_may_differ_from_signer() {
        let signer = OrderSigner::from_private_key(
            TEST_PRIVATE_KEY,
            Some("0x70997970C51812dc3A010C7d01b50e0d17dc79C8"),
            SignatureMode::Proxy,
            137,
        )
        .unwrap();
        assert_ne!(signer.funder(), signer.address());
    }

    #[test]
    fn invalid_key_is_rejected() {
        assert!(
            OrderSigner::from_private_key("not-hex", None, SignatureMode::Eoa, 137).is_err()
        );
        assert!(OrderSigner::from_private_key("0x1234", None, SignatureMode::Eoa, 137).is_err());
    }

    #[tokio::test]
    async fn buy_order_amounts_and_shape() {
        let signer = test_signer();
        let signed = signer
            .sign_order("12345", Side::Buy, dec!(0.50), dec!(100), 0)
            .await
            .unwrap();

        assert_eq!(signed.side, "BUY");
        // 0.50 * 100 shares = 50 quote units = 50_000_000 base units.
        assert_eq!(signed.maker_amount, "50000000");
        assert_eq!(signed.taker_amount, "100000000");
        assert!(signed.signature.starts_with("0x"));
        assert_eq!(signed.signature.len(), 132);
        assert!(signed.salt < (1u64 << 53));
    }

    #[tokio::test]
    async fn sell_order_swaps_amounts() {
        let signer = test_signer();
        let signed = signer
            .sign_order("12345", Side::Sell, dec!(0.40), dec!(25), 0)
            .await
            .unwrap();

        assert_eq!(signed.side, "SELL");
        assert_eq!(signed.maker_amount, "25000000");
        assert_eq!(signed.taker_amount, "10000000");
    }

    #[tokio::test]
    async fn non_numeric_instrument_is_rejected() {
        let signer = test_signer();
        let err = signer
            .sign_order("not-a-token", Side::Buy, dec!(0.5), dec!(10), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Order { .. }));
    }

    #[tokio::test]
    async fn auth_attestation_has_signature_shape() {
        let signer = test_signer();
        let sig = signer.sign_auth_attestation(1_700_000_000, 0).await.unwrap();
        assert!(sig.starts_with("0x"));
        assert_eq!(sig.len(), 132);
    }

    #[test]
    fn debug_does_not_expose_key() {
        let signer = test_signer();
        let debug_str = format!("{:?}", signer);
        assert!(!debug_str.contains("ac0974bec39a17e36ba4a6b4d238ff944bacb478"));
    }
}
