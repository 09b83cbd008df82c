//! Generating messages
//!
//! # Suffix choice
//!
//! Candidate rows stream out of SQLite as `(suffix, weight)` pairs and one is
//! kept by weighted reservoir sampling: the k-th row replaces the current
//! choice with probability `weight_k / (weight_1 + … + weight_k)`. Each row
//! ends up chosen with probability proportional to its weight in a single
//! pass, independent of row order.

use super::schema::Statements;
use super::SqlBrain;
use crate::brain::{reduce_entropy, BrainError, BrainResult, Speaker, SENTINEL};
use async_trait::async_trait;
use rand::Rng;
use rusqlite::{params, params_from_iter, types::Value, Connection};
use tokio_util::sync::CancellationToken;

/// The entropy-reduced prefix used as a lookup key.
///
/// The window owns exactly `order` terms; sliding it moves the terms and each
/// lookup binds them by value.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Window {
    terms: Box<[String]>,
}

impl Window {
    /// Build a window from literal prompt terms.
    fn from_prompt(prompt: &[String]) -> Self {
        Self {
            terms: prompt.iter().map(|w| reduce_entropy(w)).collect(),
        }
    }

    /// Drop the oldest term and append `w`, reduced.
    fn push(&mut self, w: &str) {
        if self.terms.is_empty() {
            return;
        }
        self.terms.rotate_left(1);
        let last = self.terms.len() - 1;
        self.terms[last] = reduce_entropy(w);
    }

    #[cfg(test)]
    fn terms(&self) -> &[String] {
        &self.terms
    }

    /// Query arguments: the tag followed by each term.
    fn args(&self, tag: &str) -> Vec<Value> {
        std::iter::once(Value::Text(tag.to_string()))
            .chain(self.terms.iter().map(|w| Value::Text(w.clone())))
            .collect()
    }
}

/// Choose one item with probability proportional to its weight.
///
/// Items with non-positive weight are never chosen. Returns `None` if no item
/// has positive weight.
pub fn choose_weighted<T, R, I>(rng: &mut R, items: I) -> Option<T>
where
    R: Rng + ?Sized,
    I: IntoIterator<Item = (T, i64)>,
{
    let mut total: u64 = 0;
    let mut pick = None;
    for (item, weight) in items {
        if weight <= 0 {
            continue;
        }
        total += weight as u64;
        if rng.gen_range(0..total) < weight as u64 {
            pick = Some(item);
        }
    }
    pick
}

/// Pick a weighted starting term for `tag`.
///
/// Message starts are preferred. If every start has been forgotten, any chain
/// in the tag can seed a prompt, spelled the way it was first learned.
fn new_prompt_in(conn: &Connection, stmts: &Statements, tag: &str) -> BrainResult<Vec<String>> {
    let order = stmts.order;
    let fail = |e| BrainError::store(format!("new prompt in {}", tag), e);
    let mut rng = rand::thread_rng();

    let mut stmt = conn.prepare_cached(&stmts.select_starts).map_err(fail)?;
    let rows = stmt
        .query_map(params![tag], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(fail)?;
    let rows = rows.collect::<Result<Vec<_>, _>>().map_err(fail)?;
    if let Some(w) = choose_weighted(&mut rng, rows) {
        let mut r = vec![String::new(); order];
        r[order - 1] = w;
        return Ok(r);
    }

    let mut stmt = conn.prepare_cached(&stmts.select_any).map_err(fail)?;
    let rows = stmt
        .query_map(params![tag], |row| {
            let mut terms = Vec::with_capacity(order);
            for i in 1..=order {
                terms.push(row.get::<_, String>(i)?);
            }
            Ok((terms, row.get::<_, i64>(order + 1)?))
        })
        .map_err(fail)?;
    let rows = rows.collect::<Result<Vec<_>, _>>().map_err(fail)?;
    choose_weighted(&mut rng, rows).ok_or_else(|| BrainError::NotFound {
        tag: tag.to_string(),
    })
}

/// Choose a suffix following `window` in `tag`, or the sentinel if nothing
/// follows.
fn next_in(
    conn: &Connection,
    stmts: &Statements,
    tag: &str,
    window: &Window,
) -> BrainResult<String> {
    let fail = |e| BrainError::store(format!("select chain in {}", tag), e);
    let mut stmt = conn.prepare_cached(&stmts.select_suffixes).map_err(fail)?;
    let rows = stmt
        .query_map(params_from_iter(window.args(tag)), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(fail)?;
    let rows = rows.collect::<Result<Vec<_>, _>>().map_err(fail)?;
    Ok(choose_weighted(&mut rand::thread_rng(), rows).unwrap_or_else(|| SENTINEL.to_string()))
}

impl SqlBrain {
    /// Find a prompt of length `order` seeded from data learned under `tag`.
    pub async fn new_prompt(&self, cancel: &CancellationToken, tag: &str) -> BrainResult<Vec<String>> {
        let tag = tag.to_string();
        self.run(cancel, move |conn, stmts, _| new_prompt_in(conn, stmts, &tag))
            .await
    }

    /// Choose one suffix for an entropy-reduced prefix. Returns the sentinel
    /// when the chain ends or no continuation exists.
    pub async fn next(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        prefix: &[String],
    ) -> BrainResult<String> {
        if prefix.len() != self.order() {
            return Err(BrainError::InvalidArgument(format!(
                "prefix has {} terms, brain order is {}",
                prefix.len(),
                self.order()
            )));
        }
        let tag = tag.to_string();
        let window = Window {
            terms: prefix.into(),
        };
        self.run(cancel, move |conn, stmts, _| next_in(conn, stmts, &tag, &window))
            .await
    }
}

#[async_trait]
impl Speaker for SqlBrain {
    fn order(&self) -> usize {
        self.stmts.order
    }

    async fn new_prompt(&self, cancel: &CancellationToken, tag: &str) -> BrainResult<Vec<String>> {
        SqlBrain::new_prompt(self, cancel, tag).await
    }

    async fn speak(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        prompt: &[String],
    ) -> BrainResult<Vec<String>> {
        if prompt.len() != self.order() {
            return Err(BrainError::InvalidArgument(format!(
                "prompt has {} terms, brain order is {}",
                prompt.len(),
                self.order()
            )));
        }
        let tag = tag.to_string();
        let prompt = prompt.to_vec();
        let max_len = self.max_speak_len;
        self.run(cancel, move |conn, stmts, cancel| {
            let mut window = Window::from_prompt(&prompt);
            let mut n: usize = prompt.iter().map(|w| w.chars().count() + 1).sum();
            let mut out = prompt;
            while n < max_len {
                if cancel.is_cancelled() {
                    return Err(BrainError::Cancelled);
                }
                let w = next_in(conn, stmts, &tag, &window)?;
                if w.is_empty() {
                    break;
                }
                n += w.chars().count() + 1;
                window.push(&w);
                out.push(w);
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::brain::{self, tuples_of, Learner};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_window_slides() {
        let mut w = Window::from_prompt(&strs(&["", "The", "Cat"]));
        assert_eq!(w.terms(), &strs(&["", "the", "cat"])[..]);
        w.push("SAT");
        assert_eq!(w.terms(), &strs(&["the", "cat", "sat"])[..]);
    }

    #[test]
    fn test_choose_weighted_proportional() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut heavy = 0;
        for _ in 0..4000 {
            let pick = choose_weighted(&mut rng, [("light", 1), ("heavy", 3)]).unwrap();
            if pick == "heavy" {
                heavy += 1;
            }
        }
        assert!((2800..3200).contains(&heavy), "heavy chosen {} times", heavy);
    }

    #[test]
    fn test_choose_weighted_skips_empty() {
        let mut rng = StdRng::seed_from_u64(2);
        assert_eq!(choose_weighted::<&str, _, _>(&mut rng, []), None);
        assert_eq!(choose_weighted(&mut rng, [("zero", 0), ("neg", -1)]), None);
        for _ in 0..100 {
            assert_eq!(
                choose_weighted(&mut rng, [("zero", 0), ("one", 1)]),
                Some("one")
            );
        }
    }

    #[tokio::test]
    async fn test_new_prompt_empty_tag() {
        let (br, _dir) = create_test_brain(2).await;
        let cancel = CancellationToken::new();
        let err = br.new_prompt(&cancel, "nobody").await.unwrap_err();
        assert!(err.is_not_found());
        let err = brain::speak(&br, &cancel, "nobody", "").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_new_prompt_prefers_starts() {
        let (br, _dir) = create_test_brain(3).await;
        let cancel = CancellationToken::new();
        brain::learn(&br, &cancel, &meta("t", 1, 1), "Bocchi plays guitar")
            .await
            .unwrap();
        for _ in 0..20 {
            let p = br.new_prompt(&cancel, "t").await.unwrap();
            assert_eq!(p, strs(&["", "", "Bocchi"]));
        }
    }

    #[tokio::test]
    async fn test_new_prompt_without_starts() {
        let (br, _dir) = create_test_brain(2).await;
        let cancel = CancellationToken::new();
        let m = meta("t", 1, 1);
        let toks = strs(&["only", "middle"]);
        let tuples = tuples_of(2, &toks).unwrap();
        // Keep only the tuples that do not start the message.
        br.commit(&cancel, &m, &tuples[1..]).await.unwrap();
        let p = br.new_prompt(&cancel, "t").await.unwrap();
        assert_eq!(p, strs(&["only", "middle"]));
    }

    #[tokio::test]
    async fn test_new_prompt_without_starts_keeps_case() {
        let (br, _dir) = create_test_brain(2).await;
        let cancel = CancellationToken::new();
        let tuples = tuples_of(2, &strs(&["Bocchi", "Plays", "Guitar"])).unwrap();
        br.commit(&cancel, &meta("t", 1, 1), &tuples[1..]).await.unwrap();

        for _ in 0..30 {
            let msg = brain::speak(&br, &cancel, "t", "").await.unwrap();
            assert!(
                msg == "Bocchi Plays Guitar" || msg == "Plays Guitar",
                "unexpected message {:?}",
                msg
            );
        }
    }

    #[tokio::test]
    async fn test_next_matches_case_insensitively() {
        let (br, _dir) = create_test_brain(1).await;
        let cancel = CancellationToken::new();
        brain::learn(&br, &cancel, &meta("t", 1, 1), "Hello THERE")
            .await
            .unwrap();
        let w = br.next(&cancel, "t", &strs(&["hello"])).await.unwrap();
        assert_eq!(w, "THERE");
        let w = br.next(&cancel, "t", &strs(&["there"])).await.unwrap();
        assert_eq!(w, SENTINEL);
        let w = br.next(&cancel, "t", &strs(&["unknown"])).await.unwrap();
        assert_eq!(w, SENTINEL);
        let err = br.next(&cancel, "t", &strs(&["a", "b"])).await.unwrap_err();
        assert!(matches!(err, BrainError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_speak_reproduces_only_message() {
        let (br, _dir) = create_test_brain(2).await;
        let cancel = CancellationToken::new();
        let text = "The quick brown fox jumps over the lazy dog";
        brain::learn(&br, &cancel, &meta("t", 1, 1), text).await.unwrap();

        assert_eq!(brain::speak(&br, &cancel, "t", "").await.unwrap(), text);
        // Prompts match case-insensitively; output keeps learned case.
        assert_eq!(
            brain::speak(&br, &cancel, "t", "BROWN fox").await.unwrap(),
            "BROWN fox jumps over the lazy dog"
        );
        assert_eq!(
            brain::speak(&br, &cancel, "t", "xyzzy").await.unwrap(),
            "xyzzy"
        );
    }

    #[tokio::test]
    async fn test_tags_are_isolated() {
        let (br, _dir) = create_test_brain(1).await;
        let cancel = CancellationToken::new();
        brain::learn(&br, &cancel, &meta("red", 1, 1), "apples are red")
            .await
            .unwrap();
        brain::learn(&br, &cancel, &meta("blue", 1, 1), "oceans are blue")
            .await
            .unwrap();

        for _ in 0..20 {
            let msg = brain::speak(&br, &cancel, "red", "").await.unwrap();
            assert_eq!(msg, "apples are red");
            let msg = brain::speak(&br, &cancel, "blue", "are").await.unwrap();
            assert_eq!(msg, "are blue");
        }
    }

    #[tokio::test]
    async fn test_cycle_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = super::super::SqlBrainConfig::new(dir.path().join("brain.db"));
        config.max_speak_len = 100;
        let br = SqlBrain::create(config, 1).await.unwrap();
        let cancel = CancellationToken::new();

        // a → b → a with no way to end once inside the loop.
        let m = meta("t", 1, 1);
        let tuples = vec![
            crate::brain::Tuple::new(strs(&[""]), "ping"),
            crate::brain::Tuple::new(strs(&["ping"]), "pong"),
            crate::brain::Tuple::new(strs(&["pong"]), "ping"),
        ];
        br.commit(&cancel, &m, &tuples).await.unwrap();

        let msg = brain::speak(&br, &cancel, "t", "").await.unwrap();
        let n = msg.chars().count();
        assert!(n >= 95 && n <= 105, "message of {} chars", n);
        assert!(msg.starts_with("ping pong ping"));
    }

    #[tokio::test]
    async fn test_speak_rejects_wrong_prompt_length() {
        let (br, _dir) = create_test_brain(2).await;
        let cancel = CancellationToken::new();
        let err = Speaker::speak(&br, &cancel, "t", &strs(&["one"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BrainError::InvalidArgument(_)));
    }
}
