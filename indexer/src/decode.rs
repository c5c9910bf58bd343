//! Decoding of the well-known ERC-20 / ERC-721 surface: method calls, logs and
//! contract bytecode. Anything outside that surface is kept as raw bytes.

use alloy::{
    primitives::{keccak256, Log as PrimitiveLog, B256, U256},
    sol,
    sol_types::{SolCall, SolEvent},
};
use db::{ContractKind, MethodArgument, MethodCall, ToHexString, TokenStandard, TokenTransfer};
use itertools::Itertools;
use std::collections::BTreeMap;

use crate::source::RawLog;

sol! {
    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);
        event Approval(address indexed owner, address indexed spender, uint256 value);

        function totalSupply() external view returns (uint256);
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function transfer(address to, uint256 value) external returns (bool);
        function approve(address spender, uint256 value) external returns (bool);
        function transferFrom(address from, address to, uint256 value) external returns (bool);
    }

    interface IERC721 {
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
        event Approval(address indexed owner, address indexed approved, uint256 indexed tokenId);
        event ApprovalForAll(address indexed owner, address indexed operator, bool approved);

        function ownerOf(uint256 tokenId) external view returns (address);
        function safeTransferFrom(address from, address to, uint256 tokenId) external;
        function safeTransferFrom(address from, address to, uint256 tokenId, bytes data) external;
        function setApprovalForAll(address operator, bool approved) external;
    }

    interface IGnosisSafe {
        function execTransaction(
            address to,
            uint256 value,
            bytes data,
            uint8 operation,
            uint256 safeTxGas,
            uint256 baseGas,
            uint256 gasPrice,
            address gasToken,
            address refundReceiver,
            bytes signatures
        ) external payable returns (bool);
        function getOwners() external view returns (address[]);
    }

    interface IMultiSigWallet {
        function submitTransaction(address destination, uint256 value, bytes data) external returns (uint256);
        function confirmTransaction(uint256 transactionId) external;
    }
}

pub const TRANSFER_EVENT: &str = IERC20::Transfer::SIGNATURE;
pub const APPROVAL_EVENT: &str = IERC20::Approval::SIGNATURE;
pub const APPROVAL_FOR_ALL_EVENT: &str = IERC721::ApprovalForAll::SIGNATURE;

const ERC20_SELECTORS: &[[u8; 4]] = &[
    IERC20::totalSupplyCall::SELECTOR,
    IERC20::balanceOfCall::SELECTOR,
    IERC20::transferCall::SELECTOR,
    IERC20::allowanceCall::SELECTOR,
];

const ERC721_SELECTORS: &[[u8; 4]] = &[
    IERC721::ownerOfCall::SELECTOR,
    IERC721::safeTransferFrom_0Call::SELECTOR,
    IERC721::setApprovalForAllCall::SELECTOR,
];

const SAFE_SELECTORS: &[[u8; 4]] = &[
    IGnosisSafe::execTransactionCall::SELECTOR,
    IGnosisSafe::getOwnersCall::SELECTOR,
];

const MULTISIG_WALLET_SELECTORS: &[[u8; 4]] = &[
    IMultiSigWallet::submitTransactionCall::SELECTOR,
    IMultiSigWallet::confirmTransactionCall::SELECTOR,
];

/// Selector of an arbitrary function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Topic0 of an arbitrary event signature.
pub fn event_topic(signature: &str) -> B256 {
    keccak256(signature.as_bytes())
}

fn arg(name: &str, value: String) -> MethodArgument {
    MethodArgument {
        name: name.to_string(),
        value,
    }
}

fn decode_call<C: SolCall>(input: &[u8]) -> Option<C> {
    C::abi_decode(input, true).ok()
}

/// Name and arguments of a known method. `None` for unknown selectors and
/// for call data that does not decode against the known signature.
fn known_method(input: &[u8]) -> Option<(&'static str, Vec<MethodArgument>)> {
    let sel = input.get(..4)?;

    if sel == IERC20::transferCall::SELECTOR {
        let call = decode_call::<IERC20::transferCall>(input)?;
        Some((
            "transfer",
            vec![
                arg("to", call.to.to_hex_string()),
                arg("value", call.value.to_string()),
            ],
        ))
    } else if sel == IERC20::approveCall::SELECTOR {
        let call = decode_call::<IERC20::approveCall>(input)?;
        Some((
            "approve",
            vec![
                arg("spender", call.spender.to_hex_string()),
                arg("value", call.value.to_string()),
            ],
        ))
    } else if sel == IERC20::transferFromCall::SELECTOR {
        let call = decode_call::<IERC20::transferFromCall>(input)?;
        Some((
            "transferFrom",
            vec![
                arg("from", call.from.to_hex_string()),
                arg("to", call.to.to_hex_string()),
                arg("value", call.value.to_string()),
            ],
        ))
    } else if sel == IERC721::safeTransferFrom_0Call::SELECTOR {
        let call = decode_call::<IERC721::safeTransferFrom_0Call>(input)?;
        Some((
            "safeTransferFrom",
            vec![
                arg("from", call.from.to_hex_string()),
                arg("to", call.to.to_hex_string()),
                arg("tokenId", call.tokenId.to_string()),
            ],
        ))
    } else if sel == IERC721::safeTransferFrom_1Call::SELECTOR {
        let call = decode_call::<IERC721::safeTransferFrom_1Call>(input)?;
        Some((
            "safeTransferFrom",
            vec![
                arg("from", call.from.to_hex_string()),
                arg("to", call.to.to_hex_string()),
                arg("tokenId", call.tokenId.to_string()),
                arg("data", call.data.to_hex_string()),
            ],
        ))
    } else if sel == IERC721::setApprovalForAllCall::SELECTOR {
        let call = decode_call::<IERC721::setApprovalForAllCall>(input)?;
        Some((
            "setApprovalForAll",
            vec![
                arg("operator", call.operator.to_hex_string()),
                arg("approved", call.approved.to_string()),
            ],
        ))
    } else {
        None
    }
}

/// Selector plus, for known methods, the decoded name and arguments. Input
/// shorter than a selector is not a method call.
pub fn decode_method(input: &[u8]) -> Option<MethodCall> {
    let selector = input.get(..4)?.to_hex_string();
    Some(match known_method(input) {
        Some((name, arguments)) => MethodCall {
            selector,
            name: Some(name.to_string()),
            arguments,
        },
        None => MethodCall {
            selector,
            name: None,
            arguments: Vec::new(),
        },
    })
}

fn decode_log<E: SolEvent>(log: &RawLog) -> Option<E> {
    let log = PrimitiveLog::new(log.address, log.topics.clone(), log.data.clone())?;
    E::decode_log(&log, true).ok().map(|decoded| decoded.data)
}

fn field_map<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Name and fields of a known event. ERC-20 and ERC-721 share the
/// `Transfer` and `Approval` signatures and are told apart by whether the
/// third argument is indexed. Logs that do not decode are left undecoded.
pub fn decode_event(log: &RawLog) -> Option<(String, BTreeMap<String, String>)> {
    let topic0 = *log.topics.first()?;
    let indexed_token = log.topics.len() == 4;

    let (name, fields) = if topic0 == IERC20::Transfer::SIGNATURE_HASH && indexed_token {
        let event = decode_log::<IERC721::Transfer>(log)?;
        (
            "Transfer",
            field_map([
                ("from", event.from.to_hex_string()),
                ("to", event.to.to_hex_string()),
                ("tokenId", event.tokenId.to_string()),
            ]),
        )
    } else if topic0 == IERC20::Transfer::SIGNATURE_HASH {
        let event = decode_log::<IERC20::Transfer>(log)?;
        (
            "Transfer",
            field_map([
                ("from", event.from.to_hex_string()),
                ("to", event.to.to_hex_string()),
                ("value", event.value.to_string()),
            ]),
        )
    } else if topic0 == IERC20::Approval::SIGNATURE_HASH && indexed_token {
        let event = decode_log::<IERC721::Approval>(log)?;
        (
            "Approval",
            field_map([
                ("owner", event.owner.to_hex_string()),
                ("approved", event.approved.to_hex_string()),
                ("tokenId", event.tokenId.to_string()),
            ]),
        )
    } else if topic0 == IERC20::Approval::SIGNATURE_HASH {
        let event = decode_log::<IERC20::Approval>(log)?;
        (
            "Approval",
            field_map([
                ("owner", event.owner.to_hex_string()),
                ("spender", event.spender.to_hex_string()),
                ("value", event.value.to_string()),
            ]),
        )
    } else if topic0 == IERC721::ApprovalForAll::SIGNATURE_HASH {
        let event = decode_log::<IERC721::ApprovalForAll>(log)?;
        (
            "ApprovalForAll",
            field_map([
                ("owner", event.owner.to_hex_string()),
                ("operator", event.operator.to_hex_string()),
                ("approved", event.approved.to_string()),
            ]),
        )
    } else {
        return None;
    };

    Some((name.to_string(), fields))
}

/// ERC-20 `Transfer` logs carry the amount in data, ERC-721 ones index the
/// token id as a fourth topic.
pub fn token_transfer(log: &RawLog) -> Option<TokenTransfer> {
    if log.topics.first() != Some(&IERC20::Transfer::SIGNATURE_HASH) {
        return None;
    }

    let (from, to, value, token_id, standard) = match log.topics.len() {
        3 => {
            let event = decode_log::<IERC20::Transfer>(log)?;
            (event.from, event.to, event.value, None, TokenStandard::Erc20)
        }
        4 => {
            let event = decode_log::<IERC721::Transfer>(log)?;
            (
                event.from,
                event.to,
                U256::from(1u8),
                Some(event.tokenId),
                TokenStandard::Erc721,
            )
        }
        _ => return None,
    };

    Some(TokenTransfer {
        token_address: log.address,
        from,
        to,
        value,
        token_id,
        standard,
        log_index: log.log_index,
    })
}

fn contains_all(code: &[u8], selectors: &[[u8; 4]]) -> bool {
    selectors
        .iter()
        .all(|sel| code.windows(4).any(|w| w == sel.as_slice()))
}

/// Classifies a contract by the function selectors embedded in its
/// creation bytecode.
pub fn detect_contract_kind(code: &[u8]) -> ContractKind {
    if contains_all(code, SAFE_SELECTORS) || contains_all(code, MULTISIG_WALLET_SELECTORS) {
        ContractKind::Multisig
    } else if contains_all(code, ERC721_SELECTORS) {
        ContractKind::Erc721
    } else if contains_all(code, ERC20_SELECTORS) {
        ContractKind::Erc20
    } else {
        ContractKind::Unknown
    }
}

/// First `contract <Name>` declaration in Solidity source.
pub fn contract_name_from_source(source: &str) -> Option<String> {
    source
        .split_whitespace()
        .tuple_windows()
        .find(|(keyword, _)| *keyword == "contract")
        .map(|(_, name)| {
            name.trim_end_matches(|c: char| !(c.is_alphanumeric() || c == '_'))
                .to_string()
        })
        .filter(|name| !name.is_empty())
}
