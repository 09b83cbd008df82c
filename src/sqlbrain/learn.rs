//! Recording messages
//!
//! One message is one IMMEDIATE transaction: the message row, then for each
//! tuple an upsert of its chain (bumping the weight) and an occurrence row
//! linking the chain back to the message. A chain keeps the literal prefix it
//! was first learned with.

use super::SqlBrain;
use crate::brain::{BrainError, BrainResult, Learner, MessageMeta, Tuple};
use async_trait::async_trait;
use rusqlite::{params, params_from_iter, types::Value, TransactionBehavior};
use tokio_util::sync::CancellationToken;

#[async_trait]
impl Learner for SqlBrain {
    fn order(&self) -> usize {
        self.stmts.order
    }

    async fn commit(
        &self,
        cancel: &CancellationToken,
        meta: &MessageMeta,
        tuples: &[Tuple],
    ) -> BrainResult<()> {
        let order = self.order();
        if tuples.is_empty() {
            return Err(BrainError::InvalidArgument(format!(
                "no tuples to learn for message {}",
                meta.id
            )));
        }
        if let Some(t) = tuples.iter().find(|t| t.prefix.len() != order) {
            return Err(BrainError::InvalidArgument(format!(
                "tuple prefix has {} terms, brain order is {}",
                t.prefix.len(),
                order
            )));
        }

        let meta = meta.clone();
        let tuples = tuples.to_vec();
        let n = tuples.len();
        let (id, tag) = (meta.id, meta.tag.clone());
        self.run(cancel, move |conn, stmts, cancel| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| BrainError::store(format!("begin learn in {}", meta.tag), e))?;
            let fail = |what: &str, e| BrainError::store(format!("{} in {}", what, meta.tag), e);

            tx.execute(
                &stmts.insert_message,
                params![
                    meta.id.as_bytes().as_slice(),
                    meta.tag,
                    meta.user.as_bytes().as_slice(),
                    meta.time.timestamp_millis()
                ],
            )
            .map_err(|e| fail("record message", e))?;

            {
                let mut upsert = tx
                    .prepare_cached(&stmts.upsert_chain)
                    .map_err(|e| fail("prepare chain upsert", e))?;
                let mut link = tx
                    .prepare_cached(&stmts.insert_tuple)
                    .map_err(|e| fail("prepare tuple insert", e))?;
                let mut args: Vec<Value> = Vec::with_capacity(2 * order + 2);
                for t in &tuples {
                    args.clear();
                    args.push(Value::Text(meta.tag.clone()));
                    args.extend(t.key().into_iter().map(Value::Text));
                    args.push(Value::Text(t.suffix.clone()));
                    args.extend(t.prefix.iter().map(|w| Value::Text(w.clone())));
                    let chain: i64 = upsert
                        .query_row(params_from_iter(args.iter()), |row| row.get(0))
                        .map_err(|e| fail("upsert chain", e))?;
                    link.execute(params![meta.id.as_bytes().as_slice(), chain])
                        .map_err(|e| fail("link tuple", e))?;
                }
            }

            if cancel.is_cancelled() {
                return Err(BrainError::Cancelled);
            }
            tx.commit().map_err(|e| fail("commit learn", e))
        })
        .await?;

        tracing::debug!(tag = %tag, message = %id, tuples = n, "Learned message");
        Ok(())
    }
}
