//! Forgetting
//!
//! A forget runs as one transaction moving through fixed steps:
//!
//! ```text
//! Begin ─→ Tally ─→ Unlink ─→ Prune ─→ Mark ─→ Commit
//!   │        │         │        │        │
//!   └────────┴─────────┴────────┴────────┴──→ Rollback (on any error)
//! ```
//!
//! - **Tally**: subtract each matching occurrence from its chain's weight
//! - **Unlink**: delete the matching occurrence rows
//! - **Prune**: delete chains left with no weight
//! - **Mark**: record the delete reason on the matching messages
//!
//! Only occurrences linked to matching messages are touched, so identical
//! tuples taught by other messages keep their share of the weight. Forgetting
//! the same thing twice removes nothing the second time.

use super::schema::Statements;
use super::SqlBrain;
use crate::brain::userhash::TIME_QUANTUM_SECS;
use crate::brain::{BrainError, BrainResult, Forgetter, Tuple, UserHash};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{
    params, params_from_iter, types::Value, Connection, ToSql, Transaction, TransactionBehavior,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Which messages a forget applies to
#[derive(Debug, Clone)]
enum Criterion {
    Message(Uuid),
    During {
        tag: String,
        since: DateTime<Utc>,
        before: DateTime<Utc>,
    },
    UsersSince {
        users: Vec<UserHash>,
        since: DateTime<Utc>,
    },
}

impl Criterion {
    /// Reason recorded on forgotten messages
    fn reason(&self) -> &'static str {
        match self {
            Criterion::Message(_) => "CLEARMSG",
            Criterion::During { .. } => "TIMED",
            Criterion::UsersSince { .. } => "CLEARCHAT",
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Criterion::Message(_) => "forget_message",
            Criterion::During { .. } => "forget_during",
            Criterion::UsersSince { .. } => "forget_users_since",
        }
    }

    /// Condition on `messages` selecting the affected messages. User hashes
    /// are staged in `temp.forget_users`.
    fn filter(&self) -> &'static str {
        match self {
            Criterion::Message(_) => "messages.id = :msg",
            Criterion::During { .. } => {
                "messages.tag = :tag AND messages.time >= :since AND messages.time < :before"
            }
            Criterion::UsersSince { .. } => {
                "messages.user IN (SELECT user FROM temp.forget_users) AND messages.time >= :since"
            }
        }
    }

    fn params(&self) -> Vec<(&'static str, Value)> {
        match self {
            Criterion::Message(id) => vec![(":msg", Value::Blob(id.as_bytes().to_vec()))],
            Criterion::During { tag, since, before } => vec![
                (":tag", Value::Text(tag.clone())),
                (":since", Value::Integer(since.timestamp_millis())),
                (":before", Value::Integer(before.timestamp_millis())),
            ],
            Criterion::UsersSince { since, .. } => {
                vec![(":since", Value::Integer(since.timestamp_millis()))]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Tally,
    Unlink,
    Prune,
    Mark,
}

const STEPS: [Step; 4] = [Step::Tally, Step::Unlink, Step::Prune, Step::Mark];

impl Step {
    fn sql(self, filter: &str) -> String {
        match self {
            Step::Tally => format!(
                "UPDATE chains SET weight = weight - (
                    SELECT COUNT(*) FROM tuples JOIN messages ON messages.id = tuples.msg
                    WHERE tuples.chain = chains.id AND {f}
                 )
                 WHERE id IN (
                    SELECT tuples.chain FROM tuples JOIN messages ON messages.id = tuples.msg
                    WHERE {f}
                 )",
                f = filter
            ),
            Step::Unlink => format!(
                "DELETE FROM tuples WHERE msg IN (SELECT messages.id FROM messages WHERE {})",
                filter
            ),
            Step::Prune => "DELETE FROM chains WHERE weight <= 0".to_string(),
            Step::Mark => format!(
                "UPDATE messages SET deleted = :reason WHERE deleted IS NULL AND {}",
                filter
            ),
        }
    }

    fn uses_criterion(self) -> bool {
        !matches!(self, Step::Prune)
    }
}

/// Run every step for `crit` in one transaction. Returns the number of
/// occurrences removed.
fn forget_in(conn: &mut Connection, crit: &Criterion, cancel: &CancellationToken) -> BrainResult<u64> {
    let op = crit.operation();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| BrainError::store(format!("begin {}", op), e))?;

    if let Criterion::UsersSince { users, .. } = crit {
        stage_users(&tx, users).map_err(|e| BrainError::store(format!("stage {}", op), e))?;
    }

    let filter = crit.filter();
    let values = crit.params();
    let reason = Value::Text(crit.reason().to_string());
    let mut removed = 0u64;
    for step in STEPS {
        if cancel.is_cancelled() {
            return Err(BrainError::Cancelled);
        }
        let mut args: Vec<(&str, &dyn ToSql)> = Vec::new();
        if step.uses_criterion() {
            args.extend(values.iter().map(|(k, v)| (*k, v as &dyn ToSql)));
        }
        if step == Step::Mark {
            args.push((":reason", &reason as &dyn ToSql));
        }
        let n = tx
            .execute(&step.sql(filter), args.as_slice())
            .map_err(|e| {
                tracing::warn!(operation = op, step = ?step, error = %e, "Forget failed, rolling back");
                BrainError::store(format!("{} ({:?} step)", op, step), e)
            })?;
        if step == Step::Unlink {
            removed = n as u64;
        }
    }

    if cancel.is_cancelled() {
        return Err(BrainError::Cancelled);
    }
    tx.commit()
        .map_err(|e| BrainError::store(format!("commit {}", op), e))?;
    Ok(removed)
}

/// Replace the contents of `temp.forget_users` with `users`.
fn stage_users(tx: &Transaction<'_>, users: &[UserHash]) -> rusqlite::Result<()> {
    tx.execute_batch(
        "CREATE TEMP TABLE IF NOT EXISTS forget_users (user BLOB PRIMARY KEY);
         DELETE FROM temp.forget_users;",
    )?;
    let mut insert =
        tx.prepare_cached("INSERT OR IGNORE INTO temp.forget_users (user) VALUES (?1)")?;
    for u in users {
        insert.execute(params![u.as_bytes().as_slice()])?;
    }
    Ok(())
}

/// Start of every user hash time bucket holding a live message at or after
/// `since`, oldest first.
fn buckets_in(conn: &Connection, since: DateTime<Utc>) -> BrainResult<Vec<DateTime<Utc>>> {
    let fail = |e| BrainError::store("list message buckets", e);
    let q = TIME_QUANTUM_SECS * 1000;
    let mut stmt = conn
        .prepare_cached(
            "SELECT DISTINCT CASE WHEN time >= 0 THEN time / ?2 ELSE (time - ?2 + 1) / ?2 END AS b
             FROM messages WHERE time >= ?1 AND deleted IS NULL ORDER BY b",
        )
        .map_err(fail)?;
    let rows = stmt
        .query_map(params![since.timestamp_millis(), q], |row| row.get::<_, i64>(0))
        .map_err(fail)?;
    let buckets = rows.collect::<Result<Vec<_>, _>>().map_err(fail)?;
    Ok(buckets
        .into_iter()
        .filter_map(|b| DateTime::<Utc>::from_timestamp(b * TIME_QUANTUM_SECS, 0))
        .collect())
}

/// Remove one occurrence of each tuple in `tag`, whoever taught it.
fn forget_tuples_in(
    conn: &mut Connection,
    stmts: &Statements,
    tag: &str,
    tuples: &[Tuple],
    cancel: &CancellationToken,
) -> BrainResult<u64> {
    let fail = |what: &str, e| BrainError::store(format!("forget tuples in {} ({})", tag, what), e);
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| fail("begin", e))?;

    let mut removed = 0u64;
    {
        let mut find = tx.prepare_cached(&stmts.find_chain).map_err(|e| fail("prepare", e))?;
        let mut unlink = tx.prepare_cached(&stmts.unlink_one).map_err(|e| fail("prepare", e))?;
        let mut decrement = tx
            .prepare_cached(&stmts.decrement_chain)
            .map_err(|e| fail("prepare", e))?;
        for t in tuples {
            if cancel.is_cancelled() {
                return Err(BrainError::Cancelled);
            }
            let args = std::iter::once(Value::Text(tag.to_string()))
                .chain(t.key().into_iter().map(Value::Text))
                .chain(std::iter::once(Value::Text(t.suffix.clone())));
            let chain: Option<i64> = match find.query_row(params_from_iter(args), |row| row.get(0)) {
                Ok(id) => Some(id),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(fail("find", e)),
            };
            let Some(chain) = chain else { continue };
            if unlink.execute(params![chain]).map_err(|e| fail("unlink", e))? == 0 {
                continue;
            }
            decrement
                .execute(params![chain])
                .map_err(|e| fail("tally", e))?;
            removed += 1;
        }
    }
    tx.execute(&stmts.prune_chains, [])
        .map_err(|e| fail("prune", e))?;

    if cancel.is_cancelled() {
        return Err(BrainError::Cancelled);
    }
    tx.commit().map_err(|e| fail("commit", e))?;
    Ok(removed)
}

impl SqlBrain {
    async fn forget(&self, cancel: &CancellationToken, crit: Criterion) -> BrainResult<u64> {
        let op = crit.operation();
        let removed = self
            .run(cancel, move |conn, _, cancel| forget_in(conn, &crit, cancel))
            .await?;
        tracing::info!(operation = op, removed, "Forgot tuples");
        Ok(removed)
    }

    /// List the user hash time buckets that hold live messages at or after
    /// `since`, as the start time of each bucket.
    ///
    /// A user's hash differs per bucket, so forgetting a user hashes them once
    /// for each of these and passes every hash to `forget_users_since`.
    pub async fn message_buckets_since(
        &self,
        cancel: &CancellationToken,
        since: DateTime<Utc>,
    ) -> BrainResult<Vec<DateTime<Utc>>> {
        self.run(cancel, move |conn, _, _| buckets_in(conn, since)).await
    }
}

#[async_trait]
impl Forgetter for SqlBrain {
    async fn forget_message(&self, cancel: &CancellationToken, msg: Uuid) -> BrainResult<u64> {
        self.forget(cancel, Criterion::Message(msg)).await
    }

    async fn forget_during(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        since: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> BrainResult<u64> {
        if since >= before {
            return Err(BrainError::InvalidArgument(
                "forget range must start before it ends".to_string(),
            ));
        }
        self.forget(
            cancel,
            Criterion::During {
                tag: tag.to_string(),
                since,
                before,
            },
        )
        .await
    }

    async fn forget_user_since(
        &self,
        cancel: &CancellationToken,
        user: &UserHash,
        since: DateTime<Utc>,
    ) -> BrainResult<u64> {
        self.forget_users_since(cancel, std::slice::from_ref(user), since)
            .await
    }

    async fn forget_users_since(
        &self,
        cancel: &CancellationToken,
        users: &[UserHash],
        since: DateTime<Utc>,
    ) -> BrainResult<u64> {
        if users.is_empty() {
            return Ok(0);
        }
        self.forget(
            cancel,
            Criterion::UsersSince {
                users: users.to_vec(),
                since,
            },
        )
        .await
    }

    async fn forget_tuples(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        tuples: &[Tuple],
    ) -> BrainResult<u64> {
        let order = self.order();
        if let Some(t) = tuples.iter().find(|t| t.prefix.len() != order) {
            return Err(BrainError::InvalidArgument(format!(
                "tuple prefix has {} terms, brain order is {}",
                t.prefix.len(),
                order
            )));
        }
        let tag = tag.to_string();
        let tuples = tuples.to_vec();
        let removed = self
            .run(cancel, move |conn, stmts, cancel| {
                forget_tuples_in(conn, stmts, &tag, &tuples, cancel)
            })
            .await?;
        tracing::info!(removed, "Forgot tuples by content");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::brain::{self, tokens, tuples_of};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn weight_of(br: &SqlBrain, suffix: &str) -> i64 {
        let sql = format!(
            "SELECT COALESCE(SUM(weight), 0) FROM chains WHERE suffix = '{}'",
            suffix
        );
        query_i64(br, &sql).await
    }

    #[tokio::test]
    async fn test_forget_message() {
        let (br, _dir) = create_test_brain(2).await;
        let cancel = CancellationToken::new();
        let keep = meta("t", 1, 100);
        let gone = meta("t", 2, 200);
        brain::learn(&br, &cancel, &keep, "we like cake").await.unwrap();
        brain::learn(&br, &cancel, &gone, "we like cake").await.unwrap();
        brain::learn(&br, &cancel, &meta("t", 3, 300), "we like pie").await.unwrap();
        assert_eq!(weight_of(&br, "cake").await, 2);

        let n = br.forget_message(&cancel, gone.id).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(weight_of(&br, "cake").await, 1);
        assert_eq!(weight_of(&br, "pie").await, 1);
        assert_consistent(&br).await;

        let n = br.forget_message(&cancel, keep.id).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(weight_of(&br, "cake").await, 0);
        assert_eq!(weight_of(&br, "pie").await, 1);
        assert_consistent(&br).await;

        // The remaining message is all the brain can say.
        assert_eq!(brain::speak(&br, &cancel, "t", "").await.unwrap(), "we like pie");
    }

    #[tokio::test]
    async fn test_forget_message_twice() {
        let (br, _dir) = create_test_brain(2).await;
        let cancel = CancellationToken::new();
        let m = meta("t", 1, 100);
        brain::learn(&br, &cancel, &m, "hello there").await.unwrap();
        brain::learn(&br, &cancel, &meta("t", 2, 100), "hello there").await.unwrap();

        assert_eq!(br.forget_message(&cancel, m.id).await.unwrap(), 3);
        assert_eq!(br.forget_message(&cancel, m.id).await.unwrap(), 0);
        assert_eq!(br.forget_message(&cancel, Uuid::new_v4()).await.unwrap(), 0);
        assert_eq!(query_i64(&br, "SELECT SUM(weight) FROM chains").await, 3);
        assert_eq!(
            query_i64(&br, "SELECT COUNT(*) FROM messages WHERE deleted = 'CLEARMSG'").await,
            1
        );
        assert_consistent(&br).await;
    }

    #[tokio::test]
    async fn test_forget_during() {
        let (br, _dir) = create_test_brain(1).await;
        let cancel = CancellationToken::new();
        brain::learn(&br, &cancel, &meta("t", 1, 100), "cake").await.unwrap();
        brain::learn(&br, &cancel, &meta("t", 1, 200), "pie").await.unwrap();
        brain::learn(&br, &cancel, &meta("t", 1, 300), "tea").await.unwrap();
        brain::learn(&br, &cancel, &meta("other", 1, 200), "pie").await.unwrap();

        // since is inclusive, before is exclusive
        let n = br.forget_during(&cancel, "t", at(200), at(300)).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(weight_of(&br, "cake").await, 1);
        assert_eq!(weight_of(&br, "tea").await, 1);
        // The other tag's identical message is untouched.
        assert_eq!(weight_of(&br, "pie").await, 1);
        assert_eq!(
            query_i64(&br, "SELECT COUNT(*) FROM messages WHERE deleted = 'TIMED'").await,
            1
        );
        assert_consistent(&br).await;

        let err = br.forget_during(&cancel, "t", at(300), at(300)).await.unwrap_err();
        assert!(matches!(err, BrainError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_forget_user_since() {
        let (br, _dir) = create_test_brain(2).await;
        let cancel = CancellationToken::new();
        brain::learn(&br, &cancel, &meta("t", 1, 100), "we like cake").await.unwrap();
        brain::learn(&br, &cancel, &meta("t", 1, 200), "we like pie").await.unwrap();
        brain::learn(&br, &cancel, &meta("u", 1, 300), "we like tea").await.unwrap();
        brain::learn(&br, &cancel, &meta("t", 2, 300), "we like pie").await.unwrap();

        let n = br
            .forget_user_since(&cancel, &UserHash([1; 32]), at(200))
            .await
            .unwrap();
        assert_eq!(n, 8);
        // Before the cutoff
        assert_eq!(weight_of(&br, "cake").await, 1);
        // Other users keep their share
        assert_eq!(weight_of(&br, "pie").await, 1);
        // Across every tag
        assert_eq!(weight_of(&br, "tea").await, 0);
        assert_eq!(
            query_i64(&br, "SELECT COUNT(*) FROM messages WHERE deleted = 'CLEARCHAT'").await,
            2
        );
        assert_consistent(&br).await;

        let speak = brain::speak(&br, &cancel, "u", "").await.unwrap_err();
        assert!(speak.is_not_found());
    }

    #[tokio::test]
    async fn test_forget_users_since_in_one_step() {
        let (br, _dir) = create_test_brain(2).await;
        let cancel = CancellationToken::new();
        brain::learn(&br, &cancel, &meta("t", 1, 100), "we like cake").await.unwrap();
        brain::learn(&br, &cancel, &meta("u", 2, 200), "we like tea").await.unwrap();
        brain::learn(&br, &cancel, &meta("t", 3, 300), "we like pie").await.unwrap();
        brain::learn(&br, &cancel, &meta("t", 1, 400), "we like pie").await.unwrap();

        let users = [UserHash([1; 32]), UserHash([2; 32])];
        let n = br.forget_users_since(&cancel, &users, at(150)).await.unwrap();
        assert_eq!(n, 8);
        assert_eq!(weight_of(&br, "cake").await, 1);
        assert_eq!(weight_of(&br, "tea").await, 0);
        assert_eq!(weight_of(&br, "pie").await, 1);
        assert_eq!(
            query_i64(&br, "SELECT COUNT(*) FROM messages WHERE deleted = 'CLEARCHAT'").await,
            2
        );
        assert_consistent(&br).await;

        assert_eq!(br.forget_users_since(&cancel, &[], at(0)).await.unwrap(), 0);
        assert_eq!(br.forget_users_since(&cancel, &users, at(150)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_forget_users_changes_nothing() {
        let (br, _dir) = create_test_brain(2).await;
        let cancel = CancellationToken::new();
        brain::learn(&br, &cancel, &meta("t", 1, 100), "we like cake").await.unwrap();
        brain::learn(&br, &cancel, &meta("t", 2, 2000), "we like pie").await.unwrap();

        exec(
            &br,
            "CREATE TRIGGER boom BEFORE UPDATE OF deleted ON messages
             WHEN NEW.user = X'0202020202020202020202020202020202020202020202020202020202020202'
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )
        .await;

        let users = [UserHash([1; 32]), UserHash([2; 32])];
        let err = br.forget_users_since(&cancel, &users, at(0)).await.unwrap_err();
        assert!(err.is_store());
        assert_eq!(query_i64(&br, "SELECT COUNT(*) FROM tuples").await, 8);
        assert_eq!(
            query_i64(&br, "SELECT COUNT(*) FROM messages WHERE deleted IS NULL").await,
            2
        );
        assert_consistent(&br).await;

        exec(&br, "DROP TRIGGER boom").await;
        assert_eq!(br.forget_users_since(&cancel, &users, at(0)).await.unwrap(), 8);
        assert_consistent(&br).await;
    }

    #[tokio::test]
    async fn test_message_buckets_since() {
        let (br, _dir) = create_test_brain(1).await;
        let cancel = CancellationToken::new();
        for secs in [100, 200, 1000, 5000] {
            brain::learn(&br, &cancel, &meta("t", 1, secs), "hi").await.unwrap();
        }
        let gone = meta("t", 1, 9000);
        brain::learn(&br, &cancel, &gone, "bye").await.unwrap();
        br.forget_message(&cancel, gone.id).await.unwrap();

        let buckets = br.message_buckets_since(&cancel, at(150)).await.unwrap();
        assert_eq!(buckets, vec![at(0), at(900), at(4500)]);
        assert!(br.message_buckets_since(&cancel, at(6000)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_forget() {
        let (br, _dir) = create_test_brain(2).await;
        let m = meta("t", 1, 100);
        brain::learn(&br, &CancellationToken::new(), &m, "we like cake")
            .await
            .unwrap();

        exec(&br, SLOW_TABLE).await;
        exec(
            &br,
            "CREATE TRIGGER slow_tally BEFORE UPDATE ON chains BEGIN
                SELECT COUNT(*) FROM slow a, slow b, slow c WHERE a.x + b.x + c.x > 0;
             END;",
        )
        .await;

        let started = std::time::Instant::now();
        let err = br.forget_message(&cancel_after(100), m.id).await.unwrap_err();
        assert!(matches!(err, BrainError::Cancelled), "got {:?}", err);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));

        assert_eq!(query_i64(&br, "SELECT COUNT(*) FROM tuples").await, 4);
        assert_eq!(query_i64(&br, "SELECT SUM(weight) FROM chains").await, 4);
        assert_eq!(
            query_i64(&br, "SELECT COUNT(*) FROM messages WHERE deleted IS NULL").await,
            1
        );
        assert_consistent(&br).await;
    }

    #[tokio::test]
    async fn test_forget_tuples() {
        let (br, _dir) = create_test_brain(2).await;
        let cancel = CancellationToken::new();
        brain::learn(&br, &cancel, &meta("t", 1, 100), "we like cake").await.unwrap();
        brain::learn(&br, &cancel, &meta("t", 2, 200), "we like cake").await.unwrap();

        let tuples = tuples_of(2, &tokens("we like cake")).unwrap();
        let n = br.forget_tuples(&cancel, "t", &tuples).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(weight_of(&br, "cake").await, 1);
        assert_consistent(&br).await;

        // Unknown content is ignored.
        let tuples = tuples_of(2, &tokens("nothing like this")).unwrap();
        assert_eq!(br.forget_tuples(&cancel, "t", &tuples).await.unwrap(), 0);

        let tuples = tuples_of(2, &tokens("we like cake")).unwrap();
        assert_eq!(br.forget_tuples(&cancel, "t", &tuples).await.unwrap(), 4);
        assert_eq!(br.forget_tuples(&cancel, "t", &tuples).await.unwrap(), 0);
        assert_eq!(query_i64(&br, "SELECT COUNT(*) FROM chains").await, 0);
        assert_consistent(&br).await;
    }

    #[tokio::test]
    async fn test_failed_forget_rolls_back() {
        let (br, _dir) = create_test_brain(2).await;
        let cancel = CancellationToken::new();
        let m = meta("t", 1, 100);
        brain::learn(&br, &cancel, &m, "we like cake").await.unwrap();

        exec(
            &br,
            "CREATE TRIGGER boom BEFORE UPDATE OF deleted ON messages
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )
        .await;

        let err = br.forget_message(&cancel, m.id).await.unwrap_err();
        assert!(err.is_store());
        assert_eq!(query_i64(&br, "SELECT COUNT(*) FROM tuples").await, 4);
        assert_eq!(query_i64(&br, "SELECT SUM(weight) FROM chains").await, 4);
        assert_eq!(
            query_i64(&br, "SELECT COUNT(*) FROM messages WHERE deleted IS NULL").await,
            1
        );
        assert_consistent(&br).await;
    }
}
