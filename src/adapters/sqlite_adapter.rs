//! SQLite strategy store.

use crate::domain::action::Action;
use crate::domain::block::{BlockLeaf, BlockRow};
use crate::domain::condition::Condition;
use crate::domain::config_validation::{self, SqliteSettings};
use crate::domain::error::BlocktraderError;
use crate::domain::ids::{ActionId, BlockId, ConditionId, StrategyId};
use crate::domain::payload::Parameters;
use crate::domain::strategy::{Strategy, StrategySnapshot};
use crate::domain::tree_mutation::{Change, ChangeSet};
use crate::ports::config_port::ConfigPort;
use crate::ports::strategy_store::{CommitOutcome, StrategyStore};
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::str::FromStr;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS strategies (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    is_active INTEGER NOT NULL DEFAULT 0,
    root_block_id TEXT,
    revision INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
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
    target_value REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conditions_strategy ON conditions(strategy_id);

CREATE TABLE IF NOT EXISTS actions (
    id TEXT PRIMARY KEY,
    strategy_id TEXT NOT NULL REFERENCES strategies(id) ON DELETE CASCADE,
    action_type TEXT NOT NULL,
    parameters TEXT NOT NULL DEFAULT '{}',
    action_order INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_actions_strategy ON actions(strategy_id);

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
CREATE INDEX IF NOT EXISTS idx_blocks_parent ON strategy_blocks(parent_id);
";

const STRATEGY_COLUMNS: &str = "id, owner_id, name, description, is_active, root_block_id, \
                                revision, created_at, updated_at";

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, BlocktraderError> {
        let settings = config_validation::sqlite_settings(config)?;
        Self::open(&settings)
    }

    pub fn open(settings: &SqliteSettings) -> Result<Self, BlocktraderError> {
        let busy_timeout = settings.busy_timeout;
        let manager = SqliteConnectionManager::file(&settings.path).with_init(move |conn| {
            conn.pragma_update(None, "foreign_keys", true)?;
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(settings.pool_size)
            .build(manager)
            .map_err(pool_error)?;

        let adapter = Self { pool };
        adapter.initialize_schema()?;
        Ok(adapter)
    }

    /// A private database living as long as the adapter. One connection, so
    /// every caller sees the same database.
    pub fn in_memory() -> Result<Self, BlocktraderError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.pragma_update(None, "foreign_keys", true));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(pool_error)?;

        let adapter = Self { pool };
        adapter.initialize_schema()?;
        Ok(adapter)
    }

    pub fn initialize_schema(&self) -> Result<(), BlocktraderError> {
        self.conn()?.execute_batch(SCHEMA).map_err(query_error)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, BlocktraderError> {
        self.pool.get().map_err(pool_error)
    }
}

fn pool_error(e: r2d2::Error) -> BlocktraderError {
    BlocktraderError::Database {
        reason: e.to_string(),
    }
}

fn query_error(e: rusqlite::Error) -> BlocktraderError {
    BlocktraderError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, e))
}

fn parse_optional_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|t| t.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parameters_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Parameters> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn parameters_text(parameters: &Parameters) -> Result<String, BlocktraderError> {
    Ok(serde_json::to_string(parameters)?)
}

fn strategy_from_row(row: &Row<'_>) -> rusqlite::Result<Strategy> {
    let revision: i64 = row.get(6)?;
    Ok(Strategy {
        id: parse_column(row, 0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        is_active: row.get(4)?,
        root_block_id: parse_optional_column(row, 5)?,
        revision: revision as u64,
        created_at: timestamp_column(row, 7)?,
        updated_at: timestamp_column(row, 8)?,
    })
}

fn load_strategy(conn: &Connection, id: StrategyId) -> Result<Option<Strategy>, BlocktraderError> {
    conn.query_row(
        &format!("SELECT {STRATEGY_COLUMNS} FROM strategies WHERE id = ?1"),
        params![id.to_string()],
        strategy_from_row,
    )
    .optional()
    .map_err(query_error)
}

fn load_blocks(conn: &Connection, strategy: &Strategy) -> Result<Vec<BlockRow>, BlocktraderError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, parent_id, block_type, condition_id, action_id, parameters, block_order
             FROM strategy_blocks WHERE strategy_id = ?1",
        )
        .map_err(query_error)?;
    let rows = stmt
        .query_map(params![strategy.id.to_string()], |row| {
            let block_type: String = row.get(2)?;
            Ok((
                parse_column::<BlockId>(row, 0)?,
                parse_optional_column::<BlockId>(row, 1)?,
                block_type,
                parse_optional_column::<ConditionId>(row, 3)?,
                parse_optional_column::<ActionId>(row, 4)?,
                parameters_column(row, 5)?,
                row.get::<_, u32>(6)?,
            ))
        })
        .map_err(query_error)?;

    let mut blocks = Vec::new();
    for row in rows {
        let (id, parent_id, block_type, condition_id, action_id, parameters, order) =
            row.map_err(query_error)?;
        let leaf = BlockLeaf::from_columns(&block_type, condition_id, action_id)
            .map_err(|reason| BlocktraderError::corrupt(strategy.id, format!("block {id}: {reason}")))?;
        blocks.push(BlockRow {
            id,
            strategy_id: strategy.id,
            parent_id,
            leaf,
            parameters,
            order,
        });
    }
    Ok(blocks)
}

fn load_conditions(
    conn: &Connection,
    strategy_id: StrategyId,
) -> Result<HashMap<ConditionId, Condition>, BlocktraderError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, indicator_type, symbol, interval, parameters, operator, target_value
             FROM conditions WHERE strategy_id = ?1",
        )
        .map_err(query_error)?;
    let rows = stmt
        .query_map(params![strategy_id.to_string()], |row| {
            let operator: String = row.get(5)?;
            Ok(Condition {
                id: parse_column(row, 0)?,
                indicator_type: row.get(1)?,
                symbol: row.get(2)?,
                interval: row.get(3)?,
                parameters: parameters_column(row, 4)?,
                operator: operator.parse().map_err(|e| conversion_error(5, e))?,
                target_value: row.get(6)?,
            })
        })
        .map_err(query_error)?;

    let mut conditions = HashMap::new();
    for row in rows {
        let condition = row.map_err(query_error)?;
        conditions.insert(condition.id, condition);
    }
    Ok(conditions)
}

fn load_actions(
    conn: &Connection,
    strategy_id: StrategyId,
) -> Result<HashMap<ActionId, Action>, BlocktraderError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, action_type, parameters, action_order
             FROM actions WHERE strategy_id = ?1",
        )
        .map_err(query_error)?;
    let rows = stmt
        .query_map(params![strategy_id.to_string()], |row| {
            Ok(Action {
                id: parse_column(row, 0)?,
                action_type: row.get(1)?,
                parameters: parameters_column(row, 2)?,
                order: row.get(3)?,
            })
        })
        .map_err(query_error)?;

    let mut actions = HashMap::new();
    for row in rows {
        let action = row.map_err(query_error)?;
        actions.insert(action.id, action);
    }
    Ok(actions)
}

fn insert_block(tx: &Transaction<'_>, row: &BlockRow) -> Result<(), BlocktraderError> {
    tx.execute(
        "INSERT INTO strategy_blocks
            (id, strategy_id, parent_id, block_type, condition_id, action_id, parameters, block_order)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            row.id.to_string(),
            row.strategy_id.to_string(),
            row.parent_id.map(|id| id.to_string()),
            row.leaf.block_type().as_str(),
            row.leaf.condition_id().map(|id| id.to_string()),
            row.leaf.action_id().map(|id| id.to_string()),
            parameters_text(&row.parameters)?,
            row.order,
        ],
    )
    .map_err(query_error)?;
    Ok(())
}

fn apply_change(
    tx: &Transaction<'_>,
    strategy_id: &str,
    change: &Change,
) -> Result<(), BlocktraderError> {
    match change {
        Change::InsertRoot(row) => {
            insert_block(tx, row)?;
            tx.execute(
                "UPDATE strategies SET root_block_id = ?2 WHERE id = ?1",
                params![strategy_id, row.id.to_string()],
            )
            .map_err(query_error)?;
        }
        Change::InsertBlock(row) => insert_block(tx, row)?,
        Change::InsertCondition(c) => {
            tx.execute(
                "INSERT INTO conditions
                    (id, strategy_id, indicator_type, symbol, interval, parameters, operator, target_value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    c.id.to_string(),
                    strategy_id,
                    c.indicator_type,
                    c.symbol,
                    c.interval,
                    parameters_text(&c.parameters)?,
                    c.operator.as_str(),
                    c.target_value,
                ],
            )
            .map_err(query_error)?;
        }
        Change::InsertAction(a) => {
            tx.execute(
                "INSERT INTO actions (id, strategy_id, action_type, parameters, action_order)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    a.id.to_string(),
                    strategy_id,
                    a.action_type,
                    parameters_text(&a.parameters)?,
                    a.order,
                ],
            )
            .map_err(query_error)?;
        }
        Change::UpdateBlock(row) => {
            tx.execute(
                "UPDATE strategy_blocks SET parent_id = ?2, parameters = ?3, block_order = ?4
                 WHERE id = ?1",
                params![
                    row.id.to_string(),
                    row.parent_id.map(|id| id.to_string()),
                    parameters_text(&row.parameters)?,
                    row.order,
                ],
            )
            .map_err(query_error)?;
        }
        Change::UpdateCondition(c) => {
            tx.execute(
                "UPDATE conditions SET indicator_type = ?2, symbol = ?3, interval = ?4,
                    parameters = ?5, operator = ?6, target_value = ?7
                 WHERE id = ?1",
                params![
                    c.id.to_string(),
                    c.indicator_type,
                    c.symbol,
                    c.interval,
                    parameters_text(&c.parameters)?,
                    c.operator.as_str(),
                    c.target_value,
                ],
            )
            .map_err(query_error)?;
        }
        Change::UpdateAction(a) => {
            tx.execute(
                "UPDATE actions SET action_type = ?2, parameters = ?3, action_order = ?4
                 WHERE id = ?1",
                params![
                    a.id.to_string(),
                    a.action_type,
                    parameters_text(&a.parameters)?,
                    a.order,
                ],
            )
            .map_err(query_error)?;
        }
        Change::UpdateStrategy(s) => {
            tx.execute(
                "UPDATE strategies SET name = ?2, description = ?3, is_active = ?4 WHERE id = ?1",
                params![strategy_id, s.name, s.description, s.is_active],
            )
            .map_err(query_error)?;
        }
        Change::DeleteBlocks(ids) => {
            // Parents come first; their children are already gone by cascade.
            for id in ids {
                tx.execute("DELETE FROM strategy_blocks WHERE id = ?1", params![id.to_string()])
                    .map_err(query_error)?;
            }
        }
        Change::DeleteConditions(ids) => {
            for id in ids {
                tx.execute("DELETE FROM conditions WHERE id = ?1", params![id.to_string()])
                    .map_err(query_error)?;
            }
        }
        Change::DeleteActions(ids) => {
            for id in ids {
                tx.execute("DELETE FROM actions WHERE id = ?1", params![id.to_string()])
                    .map_err(query_error)?;
            }
        }
    }
    Ok(())
}

impl StrategyStore for SqliteAdapter {
    fn insert_strategy(&self, strategy: &Strategy) -> Result<(), BlocktraderError> {
        self.conn()?
            .execute(
                &format!("INSERT INTO strategies ({STRATEGY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    strategy.id.to_string(),
                    strategy.owner_id,
                    strategy.name,
                    strategy.description,
                    strategy.is_active,
                    strategy.root_block_id.map(|id| id.to_string()),
                    strategy.revision as i64,
                    strategy.created_at.to_rfc3339(),
                    strategy.updated_at.to_rfc3339(),
                ],
            )
            .map_err(query_error)?;
        Ok(())
    }

    fn list_strategies(&self, owner_id: Option<&str>) -> Result<Vec<Strategy>, BlocktraderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {STRATEGY_COLUMNS} FROM strategies
                 WHERE ?1 IS NULL OR owner_id = ?1
                 ORDER BY created_at, rowid"
            ))
            .map_err(query_error)?;
        let rows = stmt
            .query_map(params![owner_id], strategy_from_row)
            .map_err(query_error)?;

        let mut strategies = Vec::new();
        for row in rows {
            strategies.push(row.map_err(query_error)?);
        }
        Ok(strategies)
    }

    fn load_snapshot(&self, id: StrategyId) -> Result<Option<StrategySnapshot>, BlocktraderError> {
        let mut conn = self.conn()?;
        // A read transaction pins one snapshot across the four queries.
        let tx = conn.transaction().map_err(query_error)?;
        let Some(strategy) = load_strategy(&tx, id)? else {
            return Ok(None);
        };
        let blocks = load_blocks(&tx, &strategy)?;
        let conditions = load_conditions(&tx, strategy.id)?;
        let actions = load_actions(&tx, strategy.id)?;
        tx.commit().map_err(query_error)?;

        Ok(Some(StrategySnapshot {
            strategy,
            blocks,
            conditions,
            actions,
        }))
    }

    fn commit(&self, changes: &ChangeSet) -> Result<CommitOutcome, BlocktraderError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_error)?;
        let strategy_id = changes.strategy_id.to_string();

        let bumped = tx
            .execute(
                "UPDATE strategies SET revision = revision + 1, updated_at = ?3
                 WHERE id = ?1 AND revision = ?2",
                params![
                    strategy_id,
                    changes.base_revision as i64,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(query_error)?;
        if bumped == 0 {
            return Ok(CommitOutcome::Conflict);
        }

        for change in &changes.changes {
            apply_change(&tx, &strategy_id, change)?;
        }
        tx.commit().map_err(query_error)?;
        Ok(CommitOutcome::Applied)
    }

    fn delete_strategy(&self, id: StrategyId) -> Result<bool, BlocktraderError> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM strategies WHERE id = ?1", params![id.to_string()])
            .map_err(query_error)?;
        Ok(deleted > 0)
    }
}
