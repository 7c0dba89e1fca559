use async_trait::async_trait;
use ethers::abi::{Function, Param, ParamType, StateMutability, Token};
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionRequest, H256, U256};
use ethers::utils::to_checksum;
use rust_decimal::Decimal;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::{NodeBalances, NodeHolding, NodeRecord};

/// Fixed-point precision of node amounts.
const AMOUNT_DECIMALS: u32 = 18;

/// Read-only chain access needed by the pipeline.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Every node record the storage contract holds for `address`, deleted ones included.
    async fn get_all_nodes(&self, address: &str) -> Result<Vec<NodeRecord>>;

    /// Sender of a transaction, `None` if the chain does not know the hash.
    async fn get_transaction_sender(&self, txn_hash: &str) -> Result<Option<String>>;
}

pub struct EthersChainClient {
    provider: Provider<Http>,
    storage: Address,
    get_all_nodes: Function,
}

impl EthersChainClient {
    pub fn new(rpc_url: &str, storage_contract: &str, timeout: Duration) -> Result<Self> {
        let url = reqwest::Url::parse(rpc_url)
            .map_err(|e| Error::InvalidInput(format!("bad rpc url {rpc_url}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidInput(format!("cannot build rpc client: {e}")))?;
        let provider = Provider::new(Http::new_with_client(url, client));
        let storage = parse_address(storage_contract)?;
        Ok(EthersChainClient { provider, storage, get_all_nodes: get_all_nodes_abi() })
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn get_all_nodes(&self, address: &str) -> Result<Vec<NodeRecord>> {
        let account = parse_address(address)?;
        let data = self.get_all_nodes.encode_input(&[Token::Address(account)])?;
        let call: TypedTransaction = TransactionRequest::new().to(self.storage).data(data).into();
        let raw = self.provider.call(&call, None).await?;
        decode_nodes(self.get_all_nodes.decode_output(&raw)?)
    }

    async fn get_transaction_sender(&self, txn_hash: &str) -> Result<Option<String>> {
        let hash: H256 = txn_hash
            .parse()
            .map_err(|e| Error::InvalidInput(format!("bad transaction hash {txn_hash}: {e}")))?;
        let tx = self.provider.get_transaction(hash).await?;
        Ok(tx.map(|tx| to_checksum(&tx.from, None)))
    }
}

fn parse_address(raw: &str) -> Result<Address> {
    raw.trim()
        .parse()
        .map_err(|e| Error::InvalidInput(format!("bad address {raw}: {e}")))
}

/// `getAllNodes(address) view returns ((string,uint256,uint256,uint256,uint256,bool)[])`
#[allow(deprecated)]
fn get_all_nodes_abi() -> Function {
    let node = ParamType::Tuple(vec![
        ParamType::String,
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Bool,
    ]);
    Function {
        name: "getAllNodes".to_string(),
        inputs: vec![Param { name: "account".to_string(), kind: ParamType::Address, internal_type: None }],
        outputs: vec![Param {
            name: String::new(),
            kind: ParamType::Array(Box::new(node)),
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::View,
    }
}

fn malformed(what: impl Into<String>) -> Error {
    Error::MalformedResponse(what.into())
}

fn decode_nodes(tokens: Vec<Token>) -> Result<Vec<NodeRecord>> {
    let list = tokens
        .into_iter()
        .next()
        .and_then(Token::into_array)
        .ok_or_else(|| malformed("getAllNodes did not return an array"))?;
    list.into_iter().map(decode_node).collect()
}

fn decode_node(token: Token) -> Result<NodeRecord> {
    let fields = token.into_tuple().ok_or_else(|| malformed("node record is not a tuple"))?;
    let [name, created, claimed, compounded, amount, deleted]: [Token; 6] = fields
        .try_into()
        .map_err(|f: Vec<Token>| malformed(format!("node record has {} fields", f.len())))?;

    let amount = amount.into_uint().ok_or_else(|| malformed("node amount is not a uint"))?;
    if amount > U256::from(u128::MAX) {
        return Err(malformed(format!("node amount {amount} out of range")));
    }

    Ok(NodeRecord {
        name: name.into_string().ok_or_else(|| malformed("node name is not a string"))?,
        creation_time: timestamp(created)?,
        last_claim_time: timestamp(claimed)?,
        last_compound_time: timestamp(compounded)?,
        amount: amount.as_u128(),
        deleted: deleted.into_bool().ok_or_else(|| malformed("node deleted flag is not a bool"))?,
    })
}

fn timestamp(token: Token) -> Result<i64> {
    let value = token.into_uint().ok_or_else(|| malformed("node time is not a uint"))?;
    if value > U256::from(i64::MAX as u64) {
        return Err(malformed(format!("node time {value} out of range")));
    }
    Ok(value.as_u64() as i64)
}

/// Convert an 18-decimal fixed-point amount.
pub fn from_fixed_point(raw: u128) -> Result<Decimal> {
    let mantissa = i128::try_from(raw).map_err(|_| malformed(format!("amount {raw} out of range")))?;
    Decimal::try_from_i128_with_scale(mantissa, AMOUNT_DECIMALS)
        .map(|d| d.normalize())
        .map_err(|e| malformed(format!("amount {raw}: {e}")))
}

/// Aggregate raw node records into holdings and a total.
///
/// Deleted nodes are ignored. A wallet without any active node has no total.
/// Creation time is the earliest among active nodes, claim and compound times
/// the latest.
pub fn aggregate(records: Vec<NodeRecord>) -> Result<NodeBalances> {
    let mut balances = NodeBalances::default();
    for node in records.into_iter().filter(|n| !n.deleted) {
        let amount = from_fixed_point(node.amount)?;
        let total = balances.total.unwrap_or(Decimal::ZERO);
        balances.total = Some(
            total
                .checked_add(amount)
                .ok_or_else(|| malformed("node total overflows"))?,
        );
        balances.creation_time = Some(match balances.creation_time {
            Some(t) => t.min(node.creation_time),
            None => node.creation_time,
        });
        balances.last_claim_time = balances.last_claim_time.max(Some(node.last_claim_time));
        balances.last_compound_time = balances.last_compound_time.max(Some(node.last_compound_time));
        balances.nodes.push(NodeHolding { name: node.name, amount });
    }
    Ok(balances)
}

pub async fn read_node_balances(chain: &dyn ChainClient, address: &str) -> Result<NodeBalances> {
    aggregate(chain.get_all_nodes(address).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::node;
    use std::str::FromStr;

    const WEI: u128 = 1_000_000_000_000_000_000;

    fn node_token(name: &str, created: u64, amount: u128, deleted: bool) -> Token {
        Token::Tuple(vec![
            Token::String(name.to_string()),
            Token::Uint(U256::from(created)),
            Token::Uint(U256::from(created + 10)),
            Token::Uint(U256::from(created + 20)),
            Token::Uint(U256::from(amount)),
            Token::Bool(deleted),
        ])
    }

    #[test]
    fn deleted_nodes_are_excluded_from_total() {
        let balances = aggregate(vec![node("n1", 2 * WEI, false), node("n2", 3 * WEI, true)]).unwrap();
        assert_eq!(balances.total, Some(Decimal::TWO));
        assert_eq!(balances.nodes.len(), 1);
        assert_eq!(balances.nodes[0].name, "n1");
    }

    #[test]
    fn no_active_nodes_means_no_total() {
        assert_eq!(aggregate(vec![]).unwrap().total, None);
        let balances = aggregate(vec![node("gone", WEI, true)]).unwrap();
        assert_eq!(balances.total, None);
        assert!(balances.nodes.is_empty());
        assert_eq!(balances.creation_time, None);
    }

    #[test]
    fn active_node_with_zero_amount_has_zero_total() {
        let balances = aggregate(vec![node("empty", 0, false)]).unwrap();
        assert_eq!(balances.total, Some(Decimal::ZERO));
    }

    #[test]
    fn times_are_aggregated_not_overwritten() {
        let mut early = node("early", WEI, false);
        early.creation_time = 100;
        early.last_claim_time = 500;
        early.last_compound_time = 50;
        let mut late = node("late", WEI, false);
        late.creation_time = 300;
        late.last_claim_time = 400;
        late.last_compound_time = 900;
        let mut removed = node("removed", WEI, true);
        removed.creation_time = 1;

        let balances = aggregate(vec![early, late, removed]).unwrap();
        assert_eq!(balances.creation_time, Some(100));
        assert_eq!(balances.last_claim_time, Some(500));
        assert_eq!(balances.last_compound_time, Some(900));
    }

    #[test]
    fn fixed_point_conversion() {
        assert_eq!(from_fixed_point(1_500_000_000_000_000_000).unwrap(), Decimal::from_str("1.5").unwrap());
        assert_eq!(from_fixed_point(1).unwrap(), Decimal::from_str("0.000000000000000001").unwrap());
        assert!(from_fixed_point(u128::MAX).is_err());
    }

    #[test]
    fn decodes_contract_output() {
        let tokens = vec![Token::Array(vec![
            node_token("alpha", 1_650_000_000, 2 * WEI, false),
            node_token("beta", 1_650_000_100, 3 * WEI, true),
        ])];
        let nodes = decode_nodes(tokens).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "alpha");
        assert_eq!(nodes[0].last_claim_time, 1_650_000_010);
        assert_eq!(nodes[1].amount, 3 * WEI);
        assert!(nodes[1].deleted);
    }

    #[test]
    fn rejects_unexpected_shapes() {
        assert!(decode_nodes(vec![Token::Bool(true)]).is_err());
        assert!(decode_nodes(vec![Token::Array(vec![Token::Tuple(vec![Token::Bool(false)])])]).is_err());
    }

    #[test]
    fn abi_round_trip() {
        let function = get_all_nodes_abi();
        let encoded = ethers::abi::encode(&[Token::Array(vec![node_token("alpha", 7, WEI, false)])]);
        let decoded = decode_nodes(function.decode_output(&encoded).unwrap()).unwrap();
        assert_eq!(decoded[0].name, "alpha");
        assert_eq!(decoded[0].amount, WEI);

        let input = function.encode_input(&[Token::Address(Address::zero())]).unwrap();
        assert_eq!(input.len(), 4 + 32);
    }
}
