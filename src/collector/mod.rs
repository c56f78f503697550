//! Query iterators over the indexed store: live cells and transactions
//! matching script/data filters.

mod cell;
mod transaction;

pub use cell::{cell_by_out_point, CellCollector, CellQuery, DataFilter, LiveCell, LiveCellIter, TypeFilter};
pub use transaction::{TransactionCollector, TxIter, TxQuery, TxRecord};

use ckb_types::packed::Script;
use ckb_types::prelude::*;
use thiserror::Error;

use crate::client::RpcError;
use crate::store::{SqlValue, StoreError};

/// Caller-fault errors surfaced synchronously at collector construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("at least one script filter is required")]
    MissingFilter,
    #[error("args_len {0} is shorter than the filter args ({1} bytes)")]
    ArgsLenTooSmall(i32, usize),
    #[error("args_len {0} is out of range")]
    ArgsLenOutOfRange(i32),
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("transaction {0:#x} is indexed locally but the node does not return it")]
    MissingTransaction(ckb_types::H256),
}

/// `args_len` semantics shared by both collectors: `-1` leaves the stored
/// args length unconstrained (prefix match only); a non-negative value pins
/// the exact byte length.
pub(crate) fn validate_args_len(
    args_len: i32,
    filters: &[&Script],
) -> Result<(), ValidationError> {
    if args_len == -1 {
        return Ok(());
    }
    if args_len < 0 || args_len > u16::MAX as i32 {
        return Err(ValidationError::ArgsLenOutOfRange(args_len));
    }
    for script in filters {
        let supplied = script.args().raw_data().len();
        if (args_len as usize) < supplied {
            return Err(ValidationError::ArgsLenTooSmall(args_len, supplied));
        }
    }
    Ok(())
}

/// Subquery selecting ids of scripts whose code_hash and hash_type match
/// exactly and whose args start with the filter's args. Parameters are
/// pushed onto `params` in placeholder order.
pub(crate) fn script_id_subquery(
    script: &Script,
    args_len: i32,
    params: &mut Vec<SqlValue>,
) -> String {
    let args = script.args().raw_data();
    params.push(script.code_hash().as_slice().into());
    params.push(SqlValue::Int(i64::from(script.hash_type().as_slice()[0])));
    params.push((args.len() as u64).into());
    params.push(args.as_ref().into());
    let mut sql = String::from(
        "SELECT id FROM scripts \
         WHERE code_hash = ? AND hash_type = ? AND substr(args, 1, ?) = ?",
    );
    if args_len > 0 {
        params.push((args_len as u32).into());
        sql.push_str(" AND length(args) = ?");
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::script;
    use ckb_types::core::ScriptHashType;

    #[test]
    fn args_len_bounds() {
        let s = script(0x01, ScriptHashType::Data, &[1, 2, 3]);
        assert!(validate_args_len(-1, &[&s]).is_ok());
        assert!(validate_args_len(3, &[&s]).is_ok());
        assert!(validate_args_len(10, &[&s]).is_ok());
        assert_eq!(
            validate_args_len(2, &[&s]),
            Err(ValidationError::ArgsLenTooSmall(2, 3))
        );
        assert_eq!(
            validate_args_len(-2, &[&s]),
            Err(ValidationError::ArgsLenOutOfRange(-2))
        );
        assert_eq!(
            validate_args_len(0x10000, &[&s]),
            Err(ValidationError::ArgsLenOutOfRange(0x10000))
        );
    }

    #[test]
    fn subquery_parameter_order() {
        let s = script(0x01, ScriptHashType::Data, &[0xde, 0xad]);
        let mut params = Vec::new();
        let sql = script_id_subquery(&s, -1, &mut params);
        assert!(sql.ends_with("substr(args, 1, ?) = ?"));
        assert_eq!(params.len(), 4);
        assert_eq!(params[2], SqlValue::Int(2));

        let mut params = Vec::new();
        let sql = script_id_subquery(&s, 6, &mut params);
        assert!(sql.ends_with("length(args) = ?"));
        assert_eq!(params.len(), 5);
        assert_eq!(params[4], SqlValue::Int(6));
    }
}
