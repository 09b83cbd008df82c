//! Schema and statement text for a store of a given order
//!
//! ```text
//! config    option → value          ('order' fixed at creation)
//! messages  id, tag, user, time, deleted
//! chains    id, tag, p0..pN-1, suffix, l0..lN-1, weight
//!           (aggregate, UNIQUE per tag, p and suffix; l is the first literal prefix)
//! tuples    msg → chain                          (one row per occurrence)
//! ```
//!
//! `chains.weight` always equals the number of `tuples` rows pointing at the
//! chain. Generation reads only `chains`; forgetting walks `messages` and
//! `tuples` to find exactly the occurrences to remove.

use std::fmt::Write;

/// Columns holding the reduced prefix, oldest first
fn prefix_cols(order: usize) -> Vec<String> {
    (0..order).map(|i| format!("p{}", i)).collect()
}

/// Columns holding the prefix as first learned
fn literal_cols(order: usize) -> Vec<String> {
    (0..order).map(|i| format!("l{}", i)).collect()
}

/// DDL creating every table and index for a store of `order`.
pub fn create_sql(order: usize) -> String {
    let cols = prefix_cols(order);
    let mut sql = String::from(
        "CREATE TABLE config (
            option TEXT PRIMARY KEY,
            value ANY
        );
        CREATE TABLE messages (
            id BLOB PRIMARY KEY,
            tag TEXT NOT NULL,
            user BLOB NOT NULL,
            time INTEGER NOT NULL,
            deleted TEXT
        );
        CREATE INDEX messages_tag_time ON messages(tag, time);
        CREATE INDEX messages_user_time ON messages(user, time);
        CREATE TABLE chains (
            id INTEGER PRIMARY KEY,
            tag TEXT NOT NULL,\n",
    );
    for c in &cols {
        let _ = writeln!(sql, "            {} TEXT NOT NULL,", c);
    }
    let _ = writeln!(sql, "            suffix TEXT NOT NULL,");
    for c in literal_cols(order) {
        let _ = writeln!(sql, "            {} TEXT NOT NULL,", c);
    }
    let _ = write!(
        sql,
        "            weight INTEGER NOT NULL,
            UNIQUE (tag, {}, suffix)
        );
        CREATE INDEX chains_dead ON chains(id) WHERE weight <= 0;
        CREATE TABLE tuples (
            msg BLOB NOT NULL REFERENCES messages(id),
            chain INTEGER NOT NULL REFERENCES chains(id)
        );
        CREATE INDEX tuples_msg ON tuples(msg);
        CREATE INDEX tuples_chain ON tuples(chain);",
        cols.join(", ")
    );
    sql
}

/// Statement text for a store of a fixed order.
///
/// Chain statements bind `?1` to the tag, `?2..=?N+1` to the reduced prefix,
/// and `?N+2` to the suffix where one is used. The upsert binds the literal
/// prefix to `?N+3..=?2N+2`.
#[derive(Debug, Clone)]
pub struct Statements {
    pub order: usize,
    pub insert_message: String,
    pub upsert_chain: String,
    pub insert_tuple: String,
    pub select_suffixes: String,
    pub select_starts: String,
    pub select_any: String,
    pub find_chain: String,
    pub unlink_one: String,
    pub decrement_chain: String,
    pub prune_chains: String,
}

impl Statements {
    pub fn new(order: usize) -> Self {
        let cols = prefix_cols(order);
        let literals = literal_cols(order);
        let prefix_match: Vec<String> = cols
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", c, i + 2))
            .collect();
        let prefix_match = prefix_match.join(" AND ");
        let starts: Vec<String> = cols.iter().map(|c| format!("{} = ''", c)).collect();
        let placeholders: Vec<String> = (1..=2 * order + 2).map(|i| format!("?{}", i)).collect();
        let suffix_param = order + 2;

        Self {
            order,
            insert_message: "INSERT INTO messages (id, tag, user, time) VALUES (?1, ?2, ?3, ?4)"
                .to_string(),
            upsert_chain: format!(
                "INSERT INTO chains (tag, {cols}, suffix, {lits}, weight) VALUES ({ph}, 1)
                 ON CONFLICT (tag, {cols}, suffix) DO UPDATE SET weight = weight + 1
                 RETURNING id",
                cols = cols.join(", "),
                lits = literals.join(", "),
                ph = placeholders.join(", "),
            ),
            insert_tuple: "INSERT INTO tuples (msg, chain) VALUES (?1, ?2)".to_string(),
            select_suffixes: format!(
                "SELECT suffix, weight FROM chains WHERE tag = ?1 AND {}",
                prefix_match
            ),
            select_starts: format!(
                "SELECT suffix, weight FROM chains WHERE tag = ?1 AND {} AND suffix != ''",
                starts.join(" AND ")
            ),
            select_any: format!(
                "SELECT {}, suffix, weight FROM chains WHERE tag = ?1 AND suffix != ''",
                literals.join(", ")
            ),
            find_chain: format!(
                "SELECT id FROM chains WHERE tag = ?1 AND {} AND suffix = ?{}",
                prefix_match, suffix_param
            ),
            unlink_one: "DELETE FROM tuples WHERE rowid = \
                 (SELECT rowid FROM tuples WHERE chain = ?1 LIMIT 1)"
                .to_string(),
            decrement_chain: "UPDATE chains SET weight = weight - 1 WHERE id = ?1".to_string(),
            prune_chains: "DELETE FROM chains WHERE weight <= 0".to_string(),
        }
    }
}
