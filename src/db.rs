// 🗄️ SQLite Store - canonical registry + program tables in one database
//
// Uniqueness lives in the schema, not in application logic:
//   UNIQUE(normalized_name, state) on canonical_organizations
// Upserts are INSERT ... ON CONFLICT DO NOTHING followed by a re-lookup of the
// winner, so two processes racing on one key always agree on one id.

use crate::config::{check_identifier, ConfigError, ProgramConfig, ProgramKind};
use crate::entities::{CanonicalOrganization, Link, NewOrganization, SourceRecord, UnlinkableReason};
use crate::matching::MatchKey;
use crate::registry::{LinkSummary, RegistryStore, Resolution, StoreError, UpsertBatch};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a database file
    ///
    /// `busy_timeout` bounds how long any single call waits on a lock held by
    /// another process; expiry surfaces as a transient `StoreError`.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;

        conn.busy_timeout(busy_timeout)?;

        // WAL keeps readers unblocked while a driver writes
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(SqliteStore { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(SqliteStore {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ========================================================================
    // SCHEMA
    // ========================================================================

    /// Create the registry tables (idempotent)
    pub fn setup_registry(&self) -> Result<()> {
        // state '' is the unknown-region bucket: NULLs never collide in a
        // UNIQUE index, which would allow duplicate regionless organizations
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS canonical_organizations (
                id TEXT PRIMARY KEY,
                legal_name TEXT NOT NULL,
                normalized_name TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT '',
                address TEXT,
                city TEXT,
                zip TEXT,
                first_program TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(normalized_name, state)
            );

            CREATE TABLE IF NOT EXISTS organization_sources (
                organization_id TEXT NOT NULL REFERENCES canonical_organizations(id),
                program TEXT NOT NULL,
                kind TEXT NOT NULL,
                PRIMARY KEY (organization_id, program)
            );

            CREATE TABLE IF NOT EXISTS unlinkable_records (
                program TEXT NOT NULL,
                record_id INTEGER NOT NULL,
                reason TEXT NOT NULL,
                noted_at TEXT NOT NULL,
                PRIMARY KEY (program, record_id)
            );

            CREATE INDEX IF NOT EXISTS idx_org_address
                ON canonical_organizations(address, city, state);",
        )?;

        Ok(())
    }

    /// Create a program table matching its column map
    ///
    /// Real program tables belong to the import jobs; this is for fresh
    /// databases and tests.
    pub fn create_source_table(&self, program: &ProgramConfig) -> Result<()> {
        let c = &program.columns;
        let mut columns = vec![
            format!("{} INTEGER PRIMARY KEY", c.id),
            format!("{} TEXT", c.name),
        ];
        for optional in [&c.address, &c.city, &c.state, &c.zip].into_iter().flatten() {
            columns.push(format!("{} TEXT", optional));
        }
        columns.push(format!("{} TEXT", c.organization_ref));

        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} ({columns});
             CREATE INDEX IF NOT EXISTS idx_{table}_{r} ON {table}({r});",
            table = program.table,
            columns = columns.join(", "),
            r = c.organization_ref,
        ))?;

        Ok(())
    }

    /// Bulk-load source rows into a program table
    pub fn insert_source_records(
        &mut self,
        program: &ProgramConfig,
        records: &[SourceRecord],
    ) -> Result<usize> {
        let c = &program.columns;
        let optional: Vec<(usize, &str)> = [&c.address, &c.city, &c.state, &c.zip]
            .iter()
            .enumerate()
            .filter_map(|(i, column)| column.as_deref().map(|name| (i, name)))
            .collect();

        let mut names = vec![c.id.as_str(), c.name.as_str()];
        names.extend(optional.iter().map(|(_, name)| *name));
        names.push(c.organization_ref.as_str());

        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            program.table,
            names.join(", "),
            placeholders.join(", ")
        );

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for record in records {
                let fields = [&record.address, &record.city, &record.state, &record.zip];
                let mut row: Vec<Value> = vec![record.id.into(), record.name.clone().into()];
                for (i, _) in &optional {
                    row.push(fields[*i].clone().into());
                }
                row.push(record.organization_id.clone().into());
                stmt.execute(params_from_iter(row))?;
            }
        }
        tx.commit()?;

        Ok(records.len())
    }

    /// Check a program's table and columns exist before any page runs
    pub fn validate_program(&self, program: &ProgramConfig) -> Result<()> {
        check_identifier(&program.table)?;

        let mut stmt = self.conn.prepare("SELECT name, type FROM pragma_table_info(?1)")?;
        let present: HashMap<String, String> = stmt
            .query_map([&program.table], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        if present.is_empty() {
            return Err(ConfigError::MissingTable {
                program: program.name.clone(),
                table: program.table.clone(),
            }
            .into());
        }

        for column in program.columns.all() {
            check_identifier(column)?;
            if !present.contains_key(column) {
                return Err(ConfigError::MissingColumn {
                    program: program.name.clone(),
                    table: program.table.clone(),
                    column: column.to_string(),
                }
                .into());
            }
        }

        // Same rule as SQLite's INTEGER affinity: declared type contains "INT"
        let declared = &present[program.columns.id.as_str()];
        if !declared.to_ascii_uppercase().contains("INT") {
            return Err(ConfigError::NonIntegerId {
                program: program.name.clone(),
                table: program.table.clone(),
                column: program.columns.id.clone(),
                declared: declared.clone(),
            }
            .into());
        }

        Ok(())
    }

    /// Ids of records excluded as unlinkable, with their reason
    pub fn unlinkable_records(&self, program: &ProgramConfig) -> Result<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, reason FROM unlinkable_records
             WHERE program = ?1
             ORDER BY record_id",
        )?;
        let rows = stmt
            .query_map([&program.name], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn pending_predicate(program: &ProgramConfig) -> String {
        format!(
            "t.{r} IS NULL AND NOT EXISTS (
                SELECT 1 FROM unlinkable_records u
                WHERE u.program = ?1 AND u.record_id = t.{id})",
            r = program.columns.organization_ref,
            id = program.columns.id,
        )
    }

    fn upsert_in_transaction(
        &mut self,
        templates: &[NewOrganization],
    ) -> Result<UpsertBatch, StoreError> {
        // IMMEDIATE takes the write lock up front so concurrent writers queue
        // on busy_timeout instead of failing mid-transaction
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut batch = UpsertBatch::default();
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO canonical_organizations (
                    id, legal_name, normalized_name, state, address, city, zip,
                    first_program, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(normalized_name, state) DO NOTHING",
            )?;
            let mut winner = tx.prepare_cached(
                "SELECT id FROM canonical_organizations
                 WHERE normalized_name = ?1 AND state = ?2",
            )?;

            for template in templates {
                let org = CanonicalOrganization::create(template);
                let key = &template.key;

                let inserted = match insert.execute(params![
                    org.id,
                    org.legal_name,
                    key.normalized_name,
                    key.region_column(),
                    org.address,
                    org.city,
                    org.zip,
                    org.first_program,
                    org.created_at.to_rfc3339(),
                ]) {
                    Ok(n) => n,
                    Err(e) => {
                        batch.failed.push((key.clone(), e.into()));
                        continue;
                    }
                };

                if inserted == 1 {
                    batch.resolved.insert(
                        key.clone(),
                        Resolution {
                            organization_id: org.id,
                            created: true,
                        },
                    );
                    continue;
                }

                // Someone else owns the key: use their id, never create a second
                let existing = winner
                    .query_row(params![key.normalized_name, key.region_column()], |row| {
                        row.get::<_, String>(0)
                    })
                    .optional();
                match existing {
                    Ok(Some(id)) => {
                        batch.resolved.insert(
                            key.clone(),
                            Resolution {
                                organization_id: id,
                                created: false,
                            },
                        );
                    }
                    Ok(None) => batch.failed.push((
                        key.clone(),
                        StoreError::ConflictUnresolved {
                            key: key.to_string(),
                        },
                    )),
                    Err(e) => batch.failed.push((key.clone(), e.into())),
                }
            }
        }
        tx.commit()?;

        Ok(batch)
    }
}

/// Read any SQLite value as optional text (zip codes often land as INTEGER)
fn text_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    })
}

fn column_or_null(column: &Option<String>) -> String {
    column
        .as_ref()
        .map(|c| format!("t.{}", c))
        .unwrap_or_else(|| "NULL".to_string())
}

impl RegistryStore for SqliteStore {
    fn select_unlinked(
        &self,
        program: &ProgramConfig,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        let c = &program.columns;
        let sql = format!(
            "SELECT t.{id}, t.{name}, {address}, {city}, {state}, {zip}
             FROM {table} t
             WHERE {pending}
             ORDER BY t.{id}
             LIMIT ?2",
            id = c.id,
            name = c.name,
            address = column_or_null(&c.address),
            city = column_or_null(&c.city),
            state = column_or_null(&c.state),
            zip = column_or_null(&c.zip),
            table = program.table,
            pending = Self::pending_predicate(program),
        );

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let records = stmt
            .query_map(params![program.name, limit], |row| {
                Ok(SourceRecord {
                    id: row.get(0)?,
                    name: text_at(row, 1)?,
                    address: text_at(row, 2)?,
                    city: text_at(row, 3)?,
                    state: text_at(row, 4)?,
                    zip: text_at(row, 5)?,
                    organization_id: None,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    fn lookup(&self, keys: &[MatchKey]) -> Result<HashMap<MatchKey, String>, StoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<String> = (0..keys.len())
            .map(|i| format!("(?{}, ?{})", 2 * i + 1, 2 * i + 2))
            .collect();
        let sql = format!(
            "SELECT normalized_name, state, id FROM canonical_organizations
             WHERE (normalized_name, state) IN (VALUES {})",
            rows.join(", ")
        );
        let values: Vec<&str> = keys
            .iter()
            .flat_map(|k| [k.normalized_name.as_str(), k.region_column()])
            .collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let found = stmt
            .query_map(params_from_iter(values), |row| {
                let name: String = row.get(0)?;
                let state: String = row.get(1)?;
                let id: String = row.get(2)?;
                Ok((
                    MatchKey {
                        normalized_name: name,
                        region: MatchKey::region_from_column(&state),
                    },
                    id,
                ))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;

        Ok(found)
    }

    fn upsert(&mut self, templates: &[NewOrganization]) -> UpsertBatch {
        if templates.is_empty() {
            return UpsertBatch::default();
        }
        match self.upsert_in_transaction(templates) {
            Ok(batch) => batch,
            // Nothing committed: every key stays unresolved, nothing duplicated
            Err(e) => UpsertBatch::all_failed(templates, &e.to_string()),
        }
    }

    fn link(&mut self, program: &ProgramConfig, links: &[Link]) -> Result<LinkSummary, StoreError> {
        let c = &program.columns;
        let update_sql = format!(
            "UPDATE {table} SET {r} = ?1 WHERE {id} = ?2 AND {r} IS NULL",
            table = program.table,
            r = c.organization_ref,
            id = c.id,
        );
        let exists_sql = format!("SELECT 1 FROM {} WHERE {} = ?1", program.table, c.id);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut summary = LinkSummary::default();
        {
            let mut update = tx.prepare_cached(&update_sql)?;
            let mut exists = tx.prepare_cached(&exists_sql)?;
            let mut touched = BTreeSet::new();

            for link in links {
                if update.execute(params![link.organization_id, link.record_id])? == 1 {
                    summary.linked += 1;
                    touched.insert(link.organization_id.as_str());
                } else if exists.exists(params![link.record_id])? {
                    summary.already_linked += 1;
                } else {
                    summary.missing += 1;
                }
            }

            let mut tag = tx.prepare_cached(
                "INSERT OR IGNORE INTO organization_sources (organization_id, program, kind)
                 VALUES (?1, ?2, ?3)",
            )?;
            for org_id in touched {
                tag.execute(params![org_id, program.name, program.kind.as_str()])?;
            }
        }
        tx.commit()?;

        Ok(summary)
    }

    fn mark_unlinkable(
        &mut self,
        program: &ProgramConfig,
        records: &[(i64, UnlinkableReason)],
    ) -> Result<usize, StoreError> {
        let now = Utc::now().to_rfc3339();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut marked = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO unlinkable_records (program, record_id, reason, noted_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (id, reason) in records {
                marked += stmt.execute(params![program.name, id, reason.as_str(), now])?;
            }
        }
        tx.commit()?;

        Ok(marked)
    }

    fn count_unlinked(&self, program: &ProgramConfig) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} t WHERE {}",
            program.table,
            Self::pending_predicate(program)
        );
        let count: i64 = self
            .conn
            .query_row(&sql, params![program.name], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn count_unlinkable(&self, program: &ProgramConfig) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM unlinkable_records WHERE program = ?1",
            params![program.name],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn count_organizations(&self) -> Result<u64, StoreError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM canonical_organizations", [], |row| {
                    row.get(0)
                })?;
        Ok(count as u64)
    }

    fn organization(&self, id: &str) -> Result<Option<CanonicalOrganization>, StoreError> {
        let org = self
            .conn
            .query_row(
                "SELECT id, legal_name, normalized_name, state, address, city, zip,
                        first_program, created_at
                 FROM canonical_organizations
                 WHERE id = ?1",
                [id],
                |row| {
                    let state: String = row.get(3)?;
                    let created_at: String = row.get(8)?;
                    Ok(CanonicalOrganization {
                        id: row.get(0)?,
                        legal_name: row.get(1)?,
                        normalized_name: row.get(2)?,
                        state: MatchKey::region_from_column(&state),
                        address: row.get(4)?,
                        city: row.get(5)?,
                        zip: row.get(6)?,
                        first_program: row.get(7)?,
                        created_at: DateTime::parse_from_rfc3339(&created_at)
                            .map(|dt| dt.with_timezone(&Utc))
                            .map_err(|e| {
                                rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e))
                            })?,
                        origins: BTreeSet::new(),
                        kinds: BTreeSet::new(),
                    })
                },
            )
            .optional()?;

        let Some(mut org) = org else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare_cached(
            "SELECT program, kind FROM organization_sources WHERE organization_id = ?1",
        )?;
        let tags = stmt
            .query_map([id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (program, kind) in tags {
            org.origins.insert(program);
            if ProgramKind::parse(&kind).is_some() {
                org.kinds.insert(kind);
            }
        }

        Ok(Some(org))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn loans() -> ProgramConfig {
        ProgramConfig::new("ppp_loans", ProgramKind::Loan, "ppp_loans", "borrower_name")
    }

    fn setup(records: &[SourceRecord]) -> SqliteStore {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.setup_registry().unwrap();
        store.create_source_table(&loans()).unwrap();
        store.insert_source_records(&loans(), records).unwrap();
        store
    }

    fn template(name: &str, state: Option<&str>) -> NewOrganization {
        let record = SourceRecord::new(1, name, state).with_address("1 Main St", "Fresno", "93701");
        let key = MatchKey::from_record(&record).unwrap();
        NewOrganization::from_record(key, &record, &loans())
    }

    #[test]
    fn test_setup_registry_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.setup_registry().unwrap();
        store.setup_registry().unwrap();

        assert_eq!(store.count_organizations().unwrap(), 0);
    }

    #[test]
    fn test_validate_program() {
        let store = setup(&[]);
        assert!(store.validate_program(&loans()).is_ok());

        let mut missing_table = loans();
        missing_table.table = "eidl_loans".to_string();
        let err = store.validate_program(&missing_table).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingTable { .. })
        ));

        let mut missing_column = loans();
        missing_column.columns.zip = Some("postal_code".to_string());
        let err = store.validate_program(&missing_column).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingColumn { .. })
        ));
    }

    #[test]
    fn test_validate_program_rejects_text_ids() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.setup_registry().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TABLE ppp_loans (
                    loan_number TEXT PRIMARY KEY,
                    borrower_name TEXT,
                    address TEXT, city TEXT, state TEXT, zip TEXT,
                    organization_id TEXT
                )",
            )
            .unwrap();

        let mut program = loans();
        program.columns.id = "loan_number".to_string();
        let err = store.validate_program(&program).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::NonIntegerId { declared, .. }) if declared == "TEXT"
        ));
    }

    #[test]
    fn test_organization_rejects_corrupt_timestamp() {
        let store = setup(&[]);
        store
            .connection()
            .execute(
                "INSERT INTO canonical_organizations
                    (id, legal_name, normalized_name, state, first_program, created_at)
                 VALUES ('org-x', 'Acme', 'acme', '', 'ppp_loans', 'yesterday')",
                [],
            )
            .unwrap();

        let err = store.organization("org-x").unwrap_err();
        assert!(matches!(
            err,
            StoreError::Sqlite(rusqlite::Error::FromSqlConversionFailure(8, _, _))
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_select_unlinked_orders_and_limits() {
        let mut linked = SourceRecord::new(2, "Linked Co", Some("CA"));
        linked.organization_id = Some("org-1".to_string());
        let store = setup(&[
            SourceRecord::new(3, "Gamma", Some("CA")),
            linked,
            SourceRecord::new(1, "Alpha", Some("CA")),
            SourceRecord::new(4, "Delta", None),
        ]);

        let page = store.select_unlinked(&loans(), 2).unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(store.count_unlinked(&loans()).unwrap(), 3);
    }

    #[test]
    fn test_select_reads_numeric_columns_as_text() {
        let store = setup(&[]);
        store
            .connection()
            .execute(
                "INSERT INTO ppp_loans (id, borrower_name, state, zip) VALUES (1, 12345, 'CA', 93701)",
                [],
            )
            .unwrap();

        let page = store.select_unlinked(&loans(), 10).unwrap();
        assert_eq!(page[0].name.as_deref(), Some("12345"));
        assert_eq!(page[0].zip.as_deref(), Some("93701"));
    }

    #[test]
    fn test_upsert_and_lookup() {
        let mut store = setup(&[]);

        let batch = store.upsert(&[template("Acme Inc", Some("CA")), template("Acme Inc", None)]);
        assert_eq!(batch.created(), 2);
        assert!(batch.failed.is_empty());

        let with_region = MatchKey::from_raw("ACME, INC.", Some("ca")).unwrap();
        let without = MatchKey::from_raw("acme inc", None).unwrap();
        let unknown = MatchKey::from_raw("bolt", Some("CA")).unwrap();

        let found = store
            .lookup(&[with_region.clone(), without.clone(), unknown.clone(), with_region.clone()])
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[&with_region], batch.resolved[&with_region].organization_id);
        assert_eq!(found[&without], batch.resolved[&without].organization_id);
        assert!(!found.contains_key(&unknown));
    }

    #[test]
    fn test_upsert_conflict_returns_winner() {
        let mut store = setup(&[]);

        let first = store.upsert(&[template("Acme Inc", Some("CA"))]);
        let second = store.upsert(&[template("ACME INC.", Some("CA"))]);

        let key = MatchKey::from_raw("acme inc", Some("CA")).unwrap();
        assert_eq!(second.created(), 0);
        assert_eq!(second.matched(), 1);
        assert_eq!(
            first.resolved[&key].organization_id,
            second.resolved[&key].organization_id
        );
        assert_eq!(store.count_organizations().unwrap(), 1);

        let org = store
            .organization(&first.resolved[&key].organization_id)
            .unwrap()
            .unwrap();
        assert_eq!(org.legal_name, "Acme Inc");
        assert_eq!(org.city.as_deref(), Some("Fresno"));
    }

    #[test]
    fn test_unique_index_rejects_raw_duplicate() {
        let mut store = setup(&[]);
        store.upsert(&[template("Acme", None)]);

        let result = store.connection().execute(
            "INSERT INTO canonical_organizations
                (id, legal_name, normalized_name, state, first_program, created_at)
             VALUES ('x', 'Acme', 'acme', '', 'ppp_loans', '2024-01-01T00:00:00Z')",
            [],
        );

        match result {
            Err(rusqlite::Error::SqliteFailure(err, _)) => {
                assert_eq!(err.code, rusqlite::ErrorCode::ConstraintViolation)
            }
            other => panic!("expected constraint violation, got {:?}", other),
        }
    }

    #[test]
    fn test_link_only_fills_nulls() {
        let mut store = setup(&[
            SourceRecord::new(1, "Acme", Some("CA")),
            SourceRecord::new(2, "Acme", Some("CA")),
        ]);
        let program = loans();

        let batch = store.upsert(&[template("Acme", Some("CA"))]);
        let org_id = batch.resolved.values().next().unwrap().organization_id.clone();

        let first = store
            .link(&program, &[Link { record_id: 1, organization_id: org_id.clone() }])
            .unwrap();
        let second = store
            .link(&program, &[
                Link { record_id: 1, organization_id: "other".to_string() },
                Link { record_id: 2, organization_id: org_id.clone() },
                Link { record_id: 42, organization_id: org_id.clone() },
            ])
            .unwrap();

        assert_eq!(first.linked, 1);
        assert_eq!(second, LinkSummary { linked: 1, already_linked: 1, missing: 1 });

        let stored: String = store
            .connection()
            .query_row("SELECT organization_id FROM ppp_loans WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stored, org_id);

        let org = store.organization(&org_id).unwrap().unwrap();
        assert!(org.origins.contains("ppp_loans"));
        assert!(org.is_loan_recipient());
        assert!(!org.is_grant_recipient());
    }

    #[test]
    fn test_mark_unlinkable_excludes_from_selection() {
        let mut store = setup(&[
            SourceRecord::new(1, "", Some("CA")),
            SourceRecord::new(2, "Acme", Some("CA")),
        ]);
        let program = loans();

        assert_eq!(
            store
                .mark_unlinkable(&program, &[(1, UnlinkableReason::EmptyName)])
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .mark_unlinkable(&program, &[(1, UnlinkableReason::EmptyName)])
                .unwrap(),
            0
        );

        let page = store.select_unlinked(&program, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, 2);
        assert_eq!(store.count_unlinked(&program).unwrap(), 1);
        assert_eq!(store.count_unlinkable(&program).unwrap(), 1);
        assert_eq!(
            store.unlinkable_records(&program).unwrap(),
            vec![(1, "empty_name".to_string())]
        );
    }

    #[test]
    fn test_concurrent_connections_create_one_organization() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");
        {
            let store = SqliteStore::open(&path, Duration::from_secs(10)).unwrap();
            store.setup_registry().unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                thread::spawn(move || {
                    let mut store = SqliteStore::open(&path, Duration::from_secs(10)).unwrap();
                    let key = MatchKey::from_raw("acme inc", Some("CA")).unwrap();
                    // Everyone misses on lookup before anyone inserts
                    let _ = store.lookup(&[key.clone()]).unwrap();
                    let batch = store.upsert(&[template("Acme Inc", Some("CA"))]);
                    assert!(batch.failed.is_empty(), "{:?}", batch.failed);
                    batch.resolved[&key].organization_id.clone()
                })
            })
            .collect();

        let ids: HashSet<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let store = SqliteStore::open(&path, Duration::from_secs(10)).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.count_organizations().unwrap(), 1);
    }
}
