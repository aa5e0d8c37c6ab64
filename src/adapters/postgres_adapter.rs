//! PostgreSQL strategy store.

use crate::domain::action::Action;
use crate::domain::block::{BlockLeaf, BlockRow};
use crate::domain::condition::Condition;
use crate::domain::config_validation::{self, PostgresSettings};
use crate::domain::error::BlocktraderError;
use crate::domain::ids::StrategyId;
use crate::domain::payload::Parameters;
use crate::domain::strategy::{Strategy, StrategySnapshot};
use crate::domain::tree_mutation::{Change, ChangeSet};
use crate::ports::config_port::ConfigPort;
use crate::ports::strategy_store::{CommitOutcome, StrategyStore};
use chrono::{DateTime, Utc};
use postgres::types::ToSql;
use postgres::{IsolationLevel, NoTls, Row, Transaction};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

type Manager = PostgresConnectionManager<NoTls>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS strategies (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    is_active BOOLEAN NOT NULL DEFAULT FALSE,
    root_block_id TEXT,
    revision BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_strategies_owner ON strategies(owner_id);

CREATE TABLE IF NOT EXISTS conditions (
    id TEXT PRIMARY KEY,
    strategy_id TEXT NOT NULL REFERENCES strategies(id) ON DELETE CASCADE,
    indicator_type TEXT NOT NULL,
    symbol TEXT NOT NULL,
    interval TEXT NOT NULL,
    parameters TEXT NOT NULL DEFAULT '{}',
    operator TEXT NOT NULL,
    target_value DOUBLE PRECISION NOT NULL
);

CREATE TABLE IF NOT EXISTS actions (
    id TEXT PRIMARY KEY,
    strategy_id TEXT NOT NULL REFERENCES strategies(id) ON DELETE CASCADE,
    action_type TEXT NOT NULL,
    parameters TEXT NOT NULL DEFAULT '{}',
    action_order INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS strategy_blocks (
    id TEXT PRIMARY KEY,
    strategy_id TEXT NOT NULL REFERENCES strategies(id) ON DELETE CASCADE,
    parent_id TEXT REFERENCES strategy_blocks(id) ON DELETE CASCADE,
    block_type TEXT NOT NULL,
    condition_id TEXT REFERENCES conditions(id),
    action_id TEXT REFERENCES actions(id),
    parameters TEXT NOT NULL DEFAULT '{}',
    block_order INTEGER NOT NULL,
    UNIQUE (parent_id, block_order)
);
CREATE INDEX IF NOT EXISTS idx_blocks_strategy ON strategy_blocks(strategy_id);
";

const STRATEGY_COLUMNS: &str = "id, owner_id, name, description, is_active, root_block_id, \
                                revision, created_at, updated_at";

pub struct PostgresAdapter {
    pool: Pool<Manager>,
}

impl PostgresAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, BlocktraderError> {
        let settings = config_validation::postgres_settings(config)?;
        Self::connect(&settings)
    }

    pub fn connect(settings: &PostgresSettings) -> Result<Self, BlocktraderError> {
        let pg_config: postgres::Config =
            settings
                .connection_string
                .parse()
                .map_err(|e: postgres::Error| BlocktraderError::ConfigInvalid {
                    section: "postgres".into(),
                    key: "connection_string".into(),
                    reason: e.to_string(),
                })?;
        let manager = PostgresConnectionManager::new(pg_config, NoTls);
        let pool = Pool::builder()
            .max_size(settings.pool_size)
            .build(manager)
            .map_err(pool_error)?;

        let adapter = Self { pool };
        adapter.initialize_schema()?;
        Ok(adapter)
    }

    pub fn initialize_schema(&self) -> Result<(), BlocktraderError> {
        self.conn()?.batch_execute(SCHEMA).map_err(query_error)
    }

    fn conn(&self) -> Result<PooledConnection<Manager>, BlocktraderError> {
        self.pool.get().map_err(pool_error)
    }
}

fn pool_error(e: r2d2::Error) -> BlocktraderError {
    BlocktraderError::Database {
        reason: e.to_string(),
    }
}

fn query_error(e: postgres::Error) -> BlocktraderError {
    BlocktraderError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn parse_text<T>(text: &str, column: &str) -> Result<T, BlocktraderError>
where
    T: FromStr,
    T::Err: Display,
{
    text.parse().map_err(|e: T::Err| BlocktraderError::DatabaseQuery {
        reason: format!("column {column}: {e}"),
    })
}

fn parse_optional<T>(text: Option<String>, column: &str) -> Result<Option<T>, BlocktraderError>
where
    T: FromStr,
    T::Err: Display,
{
    text.map(|t| parse_text(&t, column)).transpose()
}

fn order_param(order: u32) -> Result<i32, BlocktraderError> {
    i32::try_from(order).map_err(|_| BlocktraderError::invalid("order", "exceeds the INTEGER column range"))
}

fn order_column(value: i32) -> Result<u32, BlocktraderError> {
    u32::try_from(value).map_err(|_| BlocktraderError::DatabaseQuery {
        reason: format!("negative order {value}"),
    })
}

fn parameters_column(row: &Row, idx: usize) -> Result<Parameters, BlocktraderError> {
    let text: String = row.try_get(idx).map_err(query_error)?;
    Ok(serde_json::from_str(&text)?)
}

fn strategy_from_row(row: &Row) -> Result<Strategy, BlocktraderError> {
    let id: String = row.try_get(0).map_err(query_error)?;
    let root: Option<String> = row.try_get(5).map_err(query_error)?;
    let revision: i64 = row.try_get(6).map_err(query_error)?;
    Ok(Strategy {
        id: parse_text(&id, "strategies.id")?,
        owner_id: row.try_get(1).map_err(query_error)?,
        name: row.try_get(2).map_err(query_error)?,
        description: row.try_get(3).map_err(query_error)?,
        is_active: row.try_get(4).map_err(query_error)?,
        root_block_id: parse_optional(root, "strategies.root_block_id")?,
        revision: revision as u64,
        created_at: row.try_get::<_, DateTime<Utc>>(7).map_err(query_error)?,
        updated_at: row.try_get::<_, DateTime<Utc>>(8).map_err(query_error)?,
    })
}

fn load_snapshot_in(
    tx: &mut Transaction<'_>,
    id: StrategyId,
) -> Result<Option<StrategySnapshot>, BlocktraderError> {
    let key = id.to_string();
    let Some(row) = tx
        .query_opt(
            &format!("SELECT {STRATEGY_COLUMNS} FROM strategies WHERE id = $1"),
            &[&key],
        )
        .map_err(query_error)?
    else {
        return Ok(None);
    };
    let strategy = strategy_from_row(&row)?;

    let mut blocks = Vec::new();
    for row in tx
        .query(
            "SELECT id, parent_id, block_type, condition_id, action_id, parameters, block_order
             FROM strategy_blocks WHERE strategy_id = $1",
            &[&key],
        )
        .map_err(query_error)?
    {
        let block_id: String = row.try_get(0).map_err(query_error)?;
        let block_type: String = row.try_get(2).map_err(query_error)?;
        let leaf = BlockLeaf::from_columns(
            &block_type,
            parse_optional(row.try_get(3).map_err(query_error)?, "condition_id")?,
            parse_optional(row.try_get(4).map_err(query_error)?, "action_id")?,
        )
        .map_err(|reason| BlocktraderError::corrupt(id, format!("block {block_id}: {reason}")))?;
        blocks.push(BlockRow {
            id: parse_text(&block_id, "strategy_blocks.id")?,
            strategy_id: id,
            parent_id: parse_optional(row.try_get(1).map_err(query_error)?, "parent_id")?,
            leaf,
            parameters: parameters_column(&row, 5)?,
            order: order_column(row.try_get(6).map_err(query_error)?)?,
        });
    }

    let mut conditions = HashMap::new();
    for row in tx
        .query(
            "SELECT id, indicator_type, symbol, interval, parameters, operator, target_value
             FROM conditions WHERE strategy_id = $1",
            &[&key],
        )
        .map_err(query_error)?
    {
        let condition_id: String = row.try_get(0).map_err(query_error)?;
        let operator: String = row.try_get(5).map_err(query_error)?;
        let condition = Condition {
            id: parse_text(&condition_id, "conditions.id")?,
            indicator_type: row.try_get(1).map_err(query_error)?,
            symbol: row.try_get(2).map_err(query_error)?,
            interval: row.try_get(3).map_err(query_error)?,
            parameters: parameters_column(&row, 4)?,
            operator: parse_text(&operator, "conditions.operator")?,
            target_value: row.try_get(6).map_err(query_error)?,
        };
        conditions.insert(condition.id, condition);
    }

    let mut actions = HashMap::new();
    for row in tx
        .query(
            "SELECT id, action_type, parameters, action_order FROM actions WHERE strategy_id = $1",
            &[&key],
        )
        .map_err(query_error)?
    {
        let action_id: String = row.try_get(0).map_err(query_error)?;
        let action = Action {
            id: parse_text(&action_id, "actions.id")?,
            action_type: row.try_get(1).map_err(query_error)?,
            parameters: parameters_column(&row, 2)?,
            order: order_column(row.try_get(3).map_err(query_error)?)?,
        };
        actions.insert(action.id, action);
    }

    Ok(Some(StrategySnapshot {
        strategy,
        blocks,
        conditions,
        actions,
    }))
}

fn insert_block(tx: &mut Transaction<'_>, row: &BlockRow) -> Result<(), BlocktraderError> {
    let params: &[&(dyn ToSql + Sync)] = &[
        &row.id.to_string(),
        &row.strategy_id.to_string(),
        &row.parent_id.map(|id| id.to_string()),
        &row.leaf.block_type().as_str(),
        &row.leaf.condition_id().map(|id| id.to_string()),
        &row.leaf.action_id().map(|id| id.to_string()),
        &serde_json::to_string(&row.parameters)?,
        &order_param(row.order)?,
    ];
    tx.execute(
        "INSERT INTO strategy_blocks
            (id, strategy_id, parent_id, block_type, condition_id, action_id, parameters, block_order)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        params,
    )
    .map_err(query_error)?;
    Ok(())
}

fn apply_change(
    tx: &mut Transaction<'_>,
    strategy_id: &str,
    change: &Change,
) -> Result<(), BlocktraderError> {
    match change {
        Change::InsertRoot(row) => {
            insert_block(tx, row)?;
            tx.execute(
                "UPDATE strategies SET root_block_id = $2 WHERE id = $1",
                &[&strategy_id, &row.id.to_string()],
            )
            .map_err(query_error)?;
        }
        Change::InsertBlock(row) => insert_block(tx, row)?,
        Change::InsertCondition(c) => {
            tx.execute(
                "INSERT INTO conditions
                    (id, strategy_id, indicator_type, symbol, interval, parameters, operator, target_value)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &c.id.to_string(),
                    &strategy_id,
                    &c.indicator_type,
                    &c.symbol,
                    &c.interval,
                    &serde_json::to_string(&c.parameters)?,
                    &c.operator.as_str(),
                    &c.target_value,
                ],
            )
            .map_err(query_error)?;
        }
        Change::InsertAction(a) => {
            tx.execute(
                "INSERT INTO actions (id, strategy_id, action_type, parameters, action_order)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &a.id.to_string(),
                    &strategy_id,
                    &a.action_type,
                    &serde_json::to_string(&a.parameters)?,
                    &order_param(a.order)?,
                ],
            )
            .map_err(query_error)?;
        }
        Change::UpdateBlock(row) => {
            tx.execute(
                "UPDATE strategy_blocks SET parent_id = $2, parameters = $3, block_order = $4
                 WHERE id = $1",
                &[
                    &row.id.to_string(),
                    &row.parent_id.map(|id| id.to_string()),
                    &serde_json::to_string(&row.parameters)?,
                    &order_param(row.order)?,
                ],
            )
            .map_err(query_error)?;
        }
        Change::UpdateCondition(c) => {
            tx.execute(
                "UPDATE conditions SET indicator_type = $2, symbol = $3, interval = $4,
                    parameters = $5, operator = $6, target_value = $7
                 WHERE id = $1",
                &[
                    &c.id.to_string(),
                    &c.indicator_type,
                    &c.symbol,
                    &c.interval,
                    &serde_json::to_string(&c.parameters)?,
                    &c.operator.as_str(),
                    &c.target_value,
                ],
            )
            .map_err(query_error)?;
        }
        Change::UpdateAction(a) => {
            tx.execute(
                "UPDATE actions SET action_type = $2, parameters = $3, action_order = $4 WHERE id = $1",
                &[
                    &a.id.to_string(),
                    &a.action_type,
                    &serde_json::to_string(&a.parameters)?,
                    &order_param(a.order)?,
                ],
            )
            .map_err(query_error)?;
        }
        Change::UpdateStrategy(s) => {
            tx.execute(
                "UPDATE strategies SET name = $2, description = $3, is_active = $4 WHERE id = $1",
                &[&strategy_id, &s.name, &s.description, &s.is_active],
            )
            .map_err(query_error)?;
        }
        Change::DeleteBlocks(ids) => {
            let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
            tx.execute("DELETE FROM strategy_blocks WHERE id = ANY($1)", &[&ids])
                .map_err(query_error)?;
        }
        Change::DeleteConditions(ids) => {
            let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
            tx.execute("DELETE FROM conditions WHERE id = ANY($1)", &[&ids])
                .map_err(query_error)?;
        }
        Change::DeleteActions(ids) => {
            let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
            tx.execute("DELETE FROM actions WHERE id = ANY($1)", &[&ids])
                .map_err(query_error)?;
        }
    }
    Ok(())
}

impl StrategyStore for PostgresAdapter {
    fn insert_strategy(&self, strategy: &Strategy) -> Result<(), BlocktraderError> {
        let params: &[&(dyn ToSql + Sync)] = &[
            &strategy.id.to_string(),
            &strategy.owner_id,
            &strategy.name,
            &strategy.description,
            &strategy.is_active,
            &strategy.root_block_id.map(|id| id.to_string()),
            &(strategy.revision as i64),
            &strategy.created_at,
            &strategy.updated_at,
        ];
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO strategies ({STRATEGY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
                ),
                params,
            )
            .map_err(query_error)?;
        Ok(())
    }

    fn list_strategies(&self, owner_id: Option<&str>) -> Result<Vec<Strategy>, BlocktraderError> {
        let rows = self
            .conn()?
            .query(
                &format!(
                    "SELECT {STRATEGY_COLUMNS} FROM strategies
                     WHERE $1::TEXT IS NULL OR owner_id = $1
                     ORDER BY created_at, id"
                ),
                &[&owner_id],
            )
            .map_err(query_error)?;
        rows.iter().map(strategy_from_row).collect()
    }

    fn load_snapshot(&self, id: StrategyId) -> Result<Option<StrategySnapshot>, BlocktraderError> {
        let mut conn = self.conn()?;
        let mut tx = conn
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .map_err(query_error)?;
        let snapshot = load_snapshot_in(&mut tx, id)?;
        tx.commit().map_err(query_error)?;
        Ok(snapshot)
    }

    fn commit(&self, changes: &ChangeSet) -> Result<CommitOutcome, BlocktraderError> {
        let mut conn = self.conn()?;
        let mut tx = conn.transaction().map_err(query_error)?;
        let strategy_id = changes.strategy_id.to_string();

        // Row lock: a concurrent writer waits here, then sees the new revision.
        let bumped = tx
            .execute(
                "UPDATE strategies SET revision = revision + 1, updated_at = $3
                 WHERE id = $1 AND revision = $2",
                &[
                    &strategy_id,
                    &(changes.base_revision as i64),
                    &Utc::now(),
                ],
            )
            .map_err(query_error)?;
        if bumped == 0 {
            return Ok(CommitOutcome::Conflict);
        }

        for change in &changes.changes {
            apply_change(&mut tx, &strategy_id, change)?;
        }
        tx.commit().map_err(query_error)?;
        Ok(CommitOutcome::Applied)
    }

    fn delete_strategy(&self, id: StrategyId) -> Result<bool, BlocktraderError> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM strategies WHERE id = $1", &[&id.to_string()])
            .map_err(query_error)?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyConfig;

    impl ConfigPort for EmptyConfig {
        fn get_string(&self, _section: &str, _key: &str) -> Option<String> {
            None
        }
        fn get_int(&self, _section: &str, _key: &str, default: i64) -> i64 {
            default
        }
        fn get_bool(&self, _section: &str, _key: &str, default: bool) -> bool {
            default
        }
    }

    #[test]
    fn from_config_missing_connection_string() {
        let config = EmptyConfig;
        let result = PostgresAdapter::from_config(&config);
        match result {
            Err(BlocktraderError::ConfigMissing { section, key }) => {
                assert_eq!(section, "database");
                assert_eq!(key, "conninfo");
            }
            Err(other) => panic!("expected ConfigMissing, got: {other}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }

    #[test]
    fn order_conversions() {
        assert_eq!(order_param(7).unwrap(), 7);
        assert!(order_param(u32::MAX).is_err());
        assert!(order_column(-1).is_err());
    }
}
