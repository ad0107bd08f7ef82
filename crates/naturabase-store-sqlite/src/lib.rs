use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use naturabase_core::{
    compile_entry_search, fold_text, Age, AgeDraft, AgeId, Behavior, BehaviorDraft, BehaviorId,
    BreedingStatus, Coordinates, CoordinatesSystem, Department, DepartmentDraft, DepartmentId,
    DistanceEstimate, DistanceEstimateDraft, DistanceEstimateId, DomainError, Entry,
    EntryCandidate, EntryFilter, EntryId, EntryJoin, EntryQueryPlan, EntryRepository,
    EntryScalarKey, EntrySearchCriteria, EntityKind, Environment, EnvironmentDraft, EnvironmentId,
    Inventory, InventoryCandidate, InventoryId, InventoryRepository, InventoryScalarKey, Locality,
    LocalityDraft, LocalityId, LocalityLookup, NumberEstimate, NumberEstimateDraft,
    NumberEstimateId, Observer, ObserverDraft, ObserverId, ReferenceEntity as _, ReferenceStore,
    Sex, SexDraft, SexId, Species, SpeciesClass, SpeciesClassDraft, SpeciesClassId, SpeciesDraft,
    SpeciesId, Town, TownDraft, TownId, UserId, Weather, WeatherDraft, WeatherId,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, DatabaseName, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::BorrowedFormatItem;
use time::{Date, OffsetDateTime, Time};

const LATEST_SCHEMA_VERSION: i64 = 1;

const DATE_FORMAT: &[BorrowedFormatItem<'_>] =
    time::macros::format_description!("[year]-[month]-[day]");
const TIME_FORMAT: &[BorrowedFormatItem<'_>] = time::macros::format_description!("[hour]:[minute]");

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS observer (
  id TEXT PRIMARY KEY,
  label TEXT NOT NULL,
  label_folded TEXT NOT NULL UNIQUE,
  owner_id TEXT
);

CREATE TABLE IF NOT EXISTS species_class (
  id TEXT PRIMARY KEY,
  label TEXT NOT NULL,
  label_folded TEXT NOT NULL UNIQUE,
  owner_id TEXT
);

CREATE TABLE IF NOT EXISTS sex (
  id TEXT PRIMARY KEY,
  label TEXT NOT NULL,
  label_folded TEXT NOT NULL UNIQUE,
  owner_id TEXT
);

CREATE TABLE IF NOT EXISTS age (
  id TEXT PRIMARY KEY,
  label TEXT NOT NULL,
  label_folded TEXT NOT NULL UNIQUE,
  owner_id TEXT
);

CREATE TABLE IF NOT EXISTS number_estimate (
  id TEXT PRIMARY KEY,
  label TEXT NOT NULL,
  label_folded TEXT NOT NULL UNIQUE,
  owner_id TEXT
);

CREATE TABLE IF NOT EXISTS distance_estimate (
  id TEXT PRIMARY KEY,
  label TEXT NOT NULL,
  label_folded TEXT NOT NULL UNIQUE,
  owner_id TEXT
);

CREATE TABLE IF NOT EXISTS weather (
  id TEXT PRIMARY KEY,
  label TEXT NOT NULL,
  label_folded TEXT NOT NULL UNIQUE,
  owner_id TEXT
);

CREATE TABLE IF NOT EXISTS department (
  id TEXT PRIMARY KEY,
  code TEXT NOT NULL,
  code_folded TEXT NOT NULL UNIQUE,
  owner_id TEXT
);

CREATE TABLE IF NOT EXISTS town (
  id TEXT PRIMARY KEY,
  department_id TEXT NOT NULL,
  code INTEGER NOT NULL,
  name TEXT NOT NULL,
  name_folded TEXT NOT NULL,
  key_folded TEXT NOT NULL UNIQUE,
  owner_id TEXT,
  FOREIGN KEY (department_id) REFERENCES department(id)
);

CREATE TABLE IF NOT EXISTS locality (
  id TEXT PRIMARY KEY,
  town_id TEXT NOT NULL,
  name TEXT NOT NULL,
  name_folded TEXT NOT NULL,
  key_folded TEXT NOT NULL UNIQUE,
  altitude INTEGER NOT NULL,
  longitude REAL NOT NULL,
  latitude REAL NOT NULL,
  coordinates_system TEXT NOT NULL CHECK (coordinates_system IN ('gps','lambert93')),
  owner_id TEXT,
  FOREIGN KEY (town_id) REFERENCES town(id)
);

CREATE TABLE IF NOT EXISTS species (
  id TEXT PRIMARY KEY,
  species_class_id TEXT NOT NULL,
  code TEXT NOT NULL,
  code_folded TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  name_folded TEXT NOT NULL,
  latin_name TEXT NOT NULL,
  latin_name_folded TEXT NOT NULL,
  owner_id TEXT,
  FOREIGN KEY (species_class_id) REFERENCES species_class(id)
);

CREATE TABLE IF NOT EXISTS behavior (
  id TEXT PRIMARY KEY,
  code TEXT NOT NULL,
  code_folded TEXT NOT NULL UNIQUE,
  label TEXT NOT NULL,
  label_folded TEXT NOT NULL,
  breeding_status TEXT CHECK (breeding_status IN ('possible','probable','certain')),
  owner_id TEXT
);

CREATE TABLE IF NOT EXISTS environment (
  id TEXT PRIMARY KEY,
  code TEXT NOT NULL,
  code_folded TEXT NOT NULL UNIQUE,
  label TEXT NOT NULL,
  label_folded TEXT NOT NULL,
  owner_id TEXT
);

CREATE TABLE IF NOT EXISTS inventory (
  id TEXT PRIMARY KEY,
  observer_id TEXT NOT NULL,
  date TEXT NOT NULL,
  time TEXT,
  duration_minutes INTEGER,
  locality_id TEXT NOT NULL,
  custom_altitude INTEGER,
  custom_longitude REAL,
  custom_latitude REAL,
  custom_system TEXT CHECK (custom_system IN ('gps','lambert93')),
  temperature INTEGER,
  owner_id TEXT,
  FOREIGN KEY (observer_id) REFERENCES observer(id),
  FOREIGN KEY (locality_id) REFERENCES locality(id)
);

CREATE TABLE IF NOT EXISTS inventory_associate (
  inventory_id TEXT NOT NULL,
  observer_id TEXT NOT NULL,
  PRIMARY KEY (inventory_id, observer_id),
  FOREIGN KEY (inventory_id) REFERENCES inventory(id) ON DELETE CASCADE,
  FOREIGN KEY (observer_id) REFERENCES observer(id)
);

CREATE TABLE IF NOT EXISTS inventory_weather (
  inventory_id TEXT NOT NULL,
  weather_id TEXT NOT NULL,
  PRIMARY KEY (inventory_id, weather_id),
  FOREIGN KEY (inventory_id) REFERENCES inventory(id) ON DELETE CASCADE,
  FOREIGN KEY (weather_id) REFERENCES weather(id)
);

CREATE TABLE IF NOT EXISTS entry (
  id TEXT PRIMARY KEY,
  inventory_id TEXT NOT NULL,
  species_id TEXT NOT NULL,
  sex_id TEXT NOT NULL,
  age_id TEXT NOT NULL,
  number_estimate_id TEXT NOT NULL,
  number INTEGER,
  distance_estimate_id TEXT,
  distance INTEGER,
  comment TEXT,
  owner_id TEXT,
  FOREIGN KEY (inventory_id) REFERENCES inventory(id),
  FOREIGN KEY (species_id) REFERENCES species(id),
  FOREIGN KEY (sex_id) REFERENCES sex(id),
  FOREIGN KEY (age_id) REFERENCES age(id),
  FOREIGN KEY (number_estimate_id) REFERENCES number_estimate(id),
  FOREIGN KEY (distance_estimate_id) REFERENCES distance_estimate(id)
);

CREATE TABLE IF NOT EXISTS entry_behavior (
  entry_id TEXT NOT NULL,
  behavior_id TEXT NOT NULL,
  PRIMARY KEY (entry_id, behavior_id),
  FOREIGN KEY (entry_id) REFERENCES entry(id) ON DELETE CASCADE,
  FOREIGN KEY (behavior_id) REFERENCES behavior(id)
);

CREATE TABLE IF NOT EXISTS entry_environment (
  entry_id TEXT NOT NULL,
  environment_id TEXT NOT NULL,
  PRIMARY KEY (entry_id, environment_id),
  FOREIGN KEY (entry_id) REFERENCES entry(id) ON DELETE CASCADE,
  FOREIGN KEY (environment_id) REFERENCES environment(id)
);

CREATE INDEX IF NOT EXISTS idx_town_department ON town(department_id);
CREATE INDEX IF NOT EXISTS idx_locality_town ON locality(town_id);
CREATE INDEX IF NOT EXISTS idx_species_class ON species(species_class_id);
CREATE INDEX IF NOT EXISTS idx_inventory_locality ON inventory(locality_id);
CREATE INDEX IF NOT EXISTS idx_inventory_observer_date ON inventory(observer_id, date);
CREATE INDEX IF NOT EXISTS idx_entry_inventory ON entry(inventory_id);
CREATE INDEX IF NOT EXISTS idx_entry_species ON entry(species_id);
";

const SNAPSHOT_FILES: [&str; 15] = [
    "observers.ndjson",
    "departments.ndjson",
    "towns.ndjson",
    "localities.ndjson",
    "species_classes.ndjson",
    "species.ndjson",
    "sexes.ndjson",
    "ages.ndjson",
    "number_estimates.ndjson",
    "distance_estimates.ndjson",
    "behaviors.ndjson",
    "environments.ndjson",
    "weathers.ndjson",
    "inventories.ndjson",
    "entries.ndjson",
];

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_references: usize,
    pub skipped_existing_references: usize,
    pub imported_inventories: usize,
    pub skipped_existing_inventories: usize,
    pub imported_entries: usize,
    pub skipped_existing_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// One ranked hit from a reference-data text search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceHit {
    pub id: String,
    pub display: String,
}

impl SqliteStore {
    /// Open a SQLite-backed observation store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, now_rfc3339()?],
            )
            .context("failed to record migration version 1")?;
            tx.commit().context("failed to commit migration v1")?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// Export every table as deterministic NDJSON plus a digest manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let mut files = Vec::with_capacity(SNAPSHOT_FILES.len());
        files.push(export_file::<Observer>(out_dir, "observers.ndjson", self.list()?)?);
        files.push(export_file::<Department>(out_dir, "departments.ndjson", self.list()?)?);
        files.push(export_file::<Town>(out_dir, "towns.ndjson", self.list()?)?);
        files.push(export_file::<Locality>(out_dir, "localities.ndjson", self.list()?)?);
        files.push(export_file::<SpeciesClass>(out_dir, "species_classes.ndjson", self.list()?)?);
        files.push(export_file::<Species>(out_dir, "species.ndjson", self.list()?)?);
        files.push(export_file::<Sex>(out_dir, "sexes.ndjson", self.list()?)?);
        files.push(export_file::<Age>(out_dir, "ages.ndjson", self.list()?)?);
        files.push(export_file::<NumberEstimate>(
            out_dir,
            "number_estimates.ndjson",
            self.list()?,
        )?);
        files.push(export_file::<DistanceEstimate>(
            out_dir,
            "distance_estimates.ndjson",
            self.list()?,
        )?);
        files.push(export_file::<Behavior>(out_dir, "behaviors.ndjson", self.list()?)?);
        files.push(export_file::<Environment>(out_dir, "environments.ndjson", self.list()?)?);
        files.push(export_file::<Weather>(out_dir, "weathers.ndjson", self.list()?)?);
        files.push(export_file::<Inventory>(
            out_dir,
            "inventories.ndjson",
            self.list_inventories(None, 0)?,
        )?);
        files.push(export_file::<Entry>(out_dir, "entries.ndjson", self.list_entries()?)?);

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files,
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database, preserving
    /// row ids. Reference rows land before inventories, inventories before
    /// entries, so foreign keys stay satisfied.
    ///
    /// # Errors
    /// Returns an error when migration, manifest validation, parsing, duplicate
    /// handling, or writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest_path = in_dir.join("manifest.json");
        let manifest = read_export_manifest(&manifest_path)?;
        validate_import_manifest(in_dir, &manifest)?;

        let observers: Vec<Observer> = read_ndjson_file(&in_dir.join("observers.ndjson"))?;
        let departments: Vec<Department> = read_ndjson_file(&in_dir.join("departments.ndjson"))?;
        let towns: Vec<Town> = read_ndjson_file(&in_dir.join("towns.ndjson"))?;
        let localities: Vec<Locality> = read_ndjson_file(&in_dir.join("localities.ndjson"))?;
        let species_classes: Vec<SpeciesClass> =
            read_ndjson_file(&in_dir.join("species_classes.ndjson"))?;
        let species: Vec<Species> = read_ndjson_file(&in_dir.join("species.ndjson"))?;
        let sexes: Vec<Sex> = read_ndjson_file(&in_dir.join("sexes.ndjson"))?;
        let ages: Vec<Age> = read_ndjson_file(&in_dir.join("ages.ndjson"))?;
        let number_estimates: Vec<NumberEstimate> =
            read_ndjson_file(&in_dir.join("number_estimates.ndjson"))?;
        let distance_estimates: Vec<DistanceEstimate> =
            read_ndjson_file(&in_dir.join("distance_estimates.ndjson"))?;
        let behaviors: Vec<Behavior> = read_ndjson_file(&in_dir.join("behaviors.ndjson"))?;
        let environments: Vec<Environment> =
            read_ndjson_file(&in_dir.join("environments.ndjson"))?;
        let weathers: Vec<Weather> = read_ndjson_file(&in_dir.join("weathers.ndjson"))?;
        let inventories: Vec<Inventory> = read_ndjson_file(&in_dir.join("inventories.ndjson"))?;
        let entries: Vec<Entry> = read_ndjson_file(&in_dir.join("entries.ndjson"))?;

        let mut summary = ImportSummary::default();
        let tx = self.conn.transaction().context("failed to start import transaction")?;

        for row in &observers {
            tally_reference(
                import_label_row(&tx, "observer", &row.id.to_string(), &row.label, row.owner_id)?,
                &mut summary,
                skip_existing,
                "observer",
                &row.id.to_string(),
            )?;
        }
        for row in &species_classes {
            tally_reference(
                import_label_row(
                    &tx,
                    "species_class",
                    &row.id.to_string(),
                    &row.label,
                    row.owner_id,
                )?,
                &mut summary,
                skip_existing,
                "species_class",
                &row.id.to_string(),
            )?;
        }
        for row in &sexes {
            tally_reference(
                import_label_row(&tx, "sex", &row.id.to_string(), &row.label, row.owner_id)?,
                &mut summary,
                skip_existing,
                "sex",
                &row.id.to_string(),
            )?;
        }
        for row in &ages {
            tally_reference(
                import_label_row(&tx, "age", &row.id.to_string(), &row.label, row.owner_id)?,
                &mut summary,
                skip_existing,
                "age",
                &row.id.to_string(),
            )?;
        }
        for row in &number_estimates {
            tally_reference(
                import_label_row(
                    &tx,
                    "number_estimate",
                    &row.id.to_string(),
                    &row.label,
                    row.owner_id,
                )?,
                &mut summary,
                skip_existing,
                "number_estimate",
                &row.id.to_string(),
            )?;
        }
        for row in &distance_estimates {
            tally_reference(
                import_label_row(
                    &tx,
                    "distance_estimate",
                    &row.id.to_string(),
                    &row.label,
                    row.owner_id,
                )?,
                &mut summary,
                skip_existing,
                "distance_estimate",
                &row.id.to_string(),
            )?;
        }
        for row in &weathers {
            tally_reference(
                import_label_row(&tx, "weather", &row.id.to_string(), &row.label, row.owner_id)?,
                &mut summary,
                skip_existing,
                "weather",
                &row.id.to_string(),
            )?;
        }
        for row in &departments {
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO department(id, code, code_folded, owner_id)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        row.id.to_string(),
                        row.code,
                        fold_text(&row.code),
                        row.owner_id.map(|owner| owner.to_string()),
                    ],
                )
                .context("failed to import department row")?;
            tally_reference(
                inserted > 0,
                &mut summary,
                skip_existing,
                "department",
                &row.id.to_string(),
            )?;
        }
        for row in &towns {
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO town(id, department_id, code, name, name_folded, key_folded, owner_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        row.id.to_string(),
                        row.department_id.to_string(),
                        row.code,
                        row.name,
                        fold_text(&row.name),
                        fold_text(&format!("{}|{}", row.department_id, row.name)),
                        row.owner_id.map(|owner| owner.to_string()),
                    ],
                )
                .context("failed to import town row")?;
            tally_reference(inserted > 0, &mut summary, skip_existing, "town", &row.id.to_string())?;
        }
        for row in &localities {
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO locality(
                        id, town_id, name, name_folded, key_folded,
                        altitude, longitude, latitude, coordinates_system, owner_id
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        row.id.to_string(),
                        row.town_id.to_string(),
                        row.name,
                        fold_text(&row.name),
                        fold_text(&format!("{}|{}", row.town_id, row.name)),
                        row.coordinates.altitude,
                        row.coordinates.longitude,
                        row.coordinates.latitude,
                        row.coordinates.system.as_str(),
                        row.owner_id.map(|owner| owner.to_string()),
                    ],
                )
                .context("failed to import locality row")?;
            tally_reference(
                inserted > 0,
                &mut summary,
                skip_existing,
                "locality",
                &row.id.to_string(),
            )?;
        }
        for row in &species {
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO species(
                        id, species_class_id, code, code_folded,
                        name, name_folded, latin_name, latin_name_folded, owner_id
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        row.id.to_string(),
                        row.species_class_id.to_string(),
                        row.code,
                        fold_text(&row.code),
                        row.name,
                        fold_text(&row.name),
                        row.latin_name,
                        fold_text(&row.latin_name),
                        row.owner_id.map(|owner| owner.to_string()),
                    ],
                )
                .context("failed to import species row")?;
            tally_reference(
                inserted > 0,
                &mut summary,
                skip_existing,
                "species",
                &row.id.to_string(),
            )?;
        }
        for row in &behaviors {
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO behavior(id, code, code_folded, label, label_folded, breeding_status, owner_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        row.id.to_string(),
                        row.code,
                        fold_text(&row.code),
                        row.label,
                        fold_text(&row.label),
                        row.breeding_status.map(BreedingStatus::as_str),
                        row.owner_id.map(|owner| owner.to_string()),
                    ],
                )
                .context("failed to import behavior row")?;
            tally_reference(
                inserted > 0,
                &mut summary,
                skip_existing,
                "behavior",
                &row.id.to_string(),
            )?;
        }
        for row in &environments {
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO environment(id, code, code_folded, label, label_folded, owner_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        row.id.to_string(),
                        row.code,
                        fold_text(&row.code),
                        row.label,
                        fold_text(&row.label),
                        row.owner_id.map(|owner| owner.to_string()),
                    ],
                )
                .context("failed to import environment row")?;
            tally_reference(
                inserted > 0,
                &mut summary,
                skip_existing,
                "environment",
                &row.id.to_string(),
            )?;
        }

        for row in &inventories {
            let inserted = import_inventory_row(&tx, row)?;
            if inserted {
                summary.imported_inventories += 1;
            } else if skip_existing {
                summary.skipped_existing_inventories += 1;
            } else {
                return Err(anyhow!("inventory already exists: {}", row.id));
            }
        }
        for row in &entries {
            let inserted = import_entry_row(&tx, row)?;
            if inserted {
                summary.imported_entries += 1;
            } else if skip_existing {
                summary.skipped_existing_entries += 1;
            } else {
                return Err(anyhow!("entry already exists: {}", row.id));
            }
        }

        tx.commit().context("failed to commit import transaction")?;
        Ok(summary)
    }

    /// List a reference table through its [`ReferenceStore`] implementation.
    ///
    /// # Errors
    /// Returns [`DomainError::Storage`] when the query fails.
    pub fn list<T>(&self) -> Result<Vec<T>, DomainError>
    where
        T: naturabase_core::ReferenceEntity,
        Self: ReferenceStore<T>,
    {
        self.list_references()
    }

    /// List inventories newest-first with association sets loaded.
    ///
    /// # Errors
    /// Returns [`DomainError::Storage`] when the query fails.
    pub fn list_inventories(
        &self,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<Vec<Inventory>, DomainError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id FROM inventory ORDER BY date DESC, id ASC LIMIT ?1 OFFSET ?2",
            )
            .map_err(storage_err)?;
        let limit_value = limit.map_or(-1_i64, i64::from);
        let rows = stmt
            .query_map(params![limit_value, i64::from(offset)], |row| row.get::<_, String>(0))
            .map_err(storage_err)?;

        let mut inventories = Vec::new();
        for raw in rows {
            let raw = raw.map_err(storage_err)?;
            if let Some(inventory) = self.load_inventory(&raw)? {
                inventories.push(inventory);
            }
        }
        Ok(inventories)
    }

    /// # Errors
    /// Returns [`DomainError::Storage`] when the query fails.
    pub fn count_inventories(&self) -> Result<u64, DomainError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM inventory", [], |row| row.get(0))
            .map_err(storage_err)?;
        u64::try_from(count).map_err(|err| DomainError::Storage(err.to_string()))
    }

    fn list_entries(&self) -> Result<Vec<Entry>, DomainError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM entry ORDER BY id ASC")
            .map_err(storage_err)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0)).map_err(storage_err)?;

        let mut entries = Vec::new();
        for raw in rows {
            let raw = raw.map_err(storage_err)?;
            if let Some(entry) = self.load_entry(&raw)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// List entry rows matching `criteria`, paginated, ordered by id.
    ///
    /// Renders the same compiled plan as [`Self::count_entries`], so the count
    /// always agrees with the page union.
    ///
    /// # Errors
    /// Returns [`DomainError::Storage`] when rendering or the query fails.
    pub fn search_entries(
        &self,
        criteria: &EntrySearchCriteria,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Entry>, DomainError> {
        let plan = compile_entry_search(criteria);
        let select =
            if plan.needs_distinct() { "SELECT DISTINCT entry.id" } else { "SELECT entry.id" };
        let (mut sql, mut values) = render_entry_query(&plan, select)?;
        sql.push_str(" ORDER BY entry.id ASC LIMIT ? OFFSET ?");
        values.push(Value::Integer(i64::from(limit)));
        values.push(Value::Integer(i64::from(offset)));

        let mut stmt = self.conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))
            .map_err(storage_err)?;

        let mut ids = Vec::new();
        for raw in rows {
            ids.push(raw.map_err(storage_err)?);
        }

        let mut entries = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(entry) = self.load_entry(id)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Count entry rows matching `criteria` using the same compiled plan as
    /// [`Self::search_entries`].
    ///
    /// # Errors
    /// Returns [`DomainError::Storage`] when rendering or the query fails.
    pub fn count_entries(&self, criteria: &EntrySearchCriteria) -> Result<u64, DomainError> {
        let plan = compile_entry_search(criteria);
        let (sql, values) = render_entry_query(&plan, "SELECT COUNT(DISTINCT entry.id)")?;

        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
            .map_err(storage_err)?;
        u64::try_from(count).map_err(|err| DomainError::Storage(err.to_string()))
    }

    /// Ranked reference-data text search: primary-field prefix matches first,
    /// then primary substrings, then secondary-field matches, each group
    /// ordered by the primary field.
    ///
    /// # Errors
    /// Returns [`DomainError::Storage`] for unsearchable kinds or query
    /// failures.
    pub fn search_reference_labels(
        &self,
        kind: EntityKind,
        q: &str,
        limit: u32,
    ) -> Result<Vec<ReferenceHit>, DomainError> {
        let Some(columns) = reference_search_columns(kind) else {
            return Err(DomainError::Storage(format!(
                "entity kind {} is not text searchable",
                kind.as_str()
            )));
        };

        let needle = fold_text(q.trim());
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}%", escape_like(&needle));
        let substring = format!("%{}%", escape_like(&needle));

        let mut where_parts = vec![
            format!("{} LIKE ?2 ESCAPE '\\'", columns.primary_folded),
        ];
        for secondary in columns.secondary_folded {
            where_parts.push(format!("{secondary} LIKE ?2 ESCAPE '\\'"));
        }

        let sql = format!(
            "SELECT id, {display} FROM {table}
             WHERE {clauses}
             ORDER BY CASE
               WHEN {primary} LIKE ?1 ESCAPE '\\' THEN 0
               WHEN {primary} LIKE ?2 ESCAPE '\\' THEN 1
               ELSE 2
             END ASC, {primary} ASC
             LIMIT ?3",
            display = columns.display,
            table = columns.table,
            clauses = where_parts.join(" OR "),
            primary = columns.primary_folded,
        );

        let mut stmt = self.conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(params![prefix, substring, i64::from(limit)], |row| {
                Ok(ReferenceHit { id: row.get(0)?, display: row.get(1)? })
            })
            .map_err(storage_err)?;

        let mut hits = Vec::new();
        for row in rows {
            hits.push(row.map_err(storage_err)?);
        }
        Ok(hits)
    }

    fn load_inventory(&self, id: &str) -> Result<Option<Inventory>, DomainError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, observer_id, date, time, duration_minutes, locality_id,
                        custom_altitude, custom_longitude, custom_latitude, custom_system,
                        temperature, owner_id
                 FROM inventory WHERE id = ?1",
                params![id],
                |row| {
                    Ok(InventoryRow {
                        id: row.get(0)?,
                        observer_id: row.get(1)?,
                        date: row.get(2)?,
                        time: row.get(3)?,
                        duration_minutes: row.get(4)?,
                        locality_id: row.get(5)?,
                        custom_altitude: row.get(6)?,
                        custom_longitude: row.get(7)?,
                        custom_latitude: row.get(8)?,
                        custom_system: row.get(9)?,
                        temperature: row.get(10)?,
                        owner_id: row.get(11)?,
                    })
                },
            )
            .optional()
            .map_err(storage_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let associate_ids = self.load_id_set(
            "SELECT observer_id FROM inventory_associate WHERE inventory_id = ?1 ORDER BY observer_id",
            id,
            ObserverId::parse,
        )?;
        let weather_ids = self.load_id_set(
            "SELECT weather_id FROM inventory_weather WHERE inventory_id = ?1 ORDER BY weather_id",
            id,
            WeatherId::parse,
        )?;

        Ok(Some(Inventory {
            id: parse_id(&row.id, InventoryId::parse)?,
            observer_id: parse_id(&row.observer_id, ObserverId::parse)?,
            associate_ids,
            date: date_from_text(&row.date)?,
            time: row.time.as_deref().map(time_from_text).transpose()?,
            duration_minutes: row.duration_minutes,
            locality_id: parse_id(&row.locality_id, LocalityId::parse)?,
            custom_coordinates: coordinates_from_parts(
                row.custom_altitude,
                row.custom_longitude,
                row.custom_latitude,
                row.custom_system.as_deref(),
            )?,
            temperature: row.temperature,
            weather_ids,
            owner_id: parse_owner(row.owner_id.as_deref())?,
        }))
    }

    fn load_entry(&self, id: &str) -> Result<Option<Entry>, DomainError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, inventory_id, species_id, sex_id, age_id, number_estimate_id,
                        number, distance_estimate_id, distance, comment, owner_id
                 FROM entry WHERE id = ?1",
                params![id],
                |row| {
                    Ok(EntryRow {
                        id: row.get(0)?,
                        inventory_id: row.get(1)?,
                        species_id: row.get(2)?,
                        sex_id: row.get(3)?,
                        age_id: row.get(4)?,
                        number_estimate_id: row.get(5)?,
                        number: row.get(6)?,
                        distance_estimate_id: row.get(7)?,
                        distance: row.get(8)?,
                        comment: row.get(9)?,
                        owner_id: row.get(10)?,
                    })
                },
            )
            .optional()
            .map_err(storage_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let behavior_ids = self.load_id_set(
            "SELECT behavior_id FROM entry_behavior WHERE entry_id = ?1 ORDER BY behavior_id",
            id,
            BehaviorId::parse,
        )?;
        let environment_ids = self.load_id_set(
            "SELECT environment_id FROM entry_environment WHERE entry_id = ?1 ORDER BY environment_id",
            id,
            EnvironmentId::parse,
        )?;

        Ok(Some(Entry {
            id: parse_id(&row.id, EntryId::parse)?,
            inventory_id: parse_id(&row.inventory_id, InventoryId::parse)?,
            species_id: parse_id(&row.species_id, SpeciesId::parse)?,
            sex_id: parse_id(&row.sex_id, SexId::parse)?,
            age_id: parse_id(&row.age_id, AgeId::parse)?,
            number_estimate_id: parse_id(&row.number_estimate_id, NumberEstimateId::parse)?,
            number: row.number,
            distance_estimate_id: row
                .distance_estimate_id
                .as_deref()
                .map(|raw| parse_id(raw, DistanceEstimateId::parse))
                .transpose()?,
            distance: row.distance,
            comment: row.comment,
            behavior_ids,
            environment_ids,
            owner_id: parse_owner(row.owner_id.as_deref())?,
        }))
    }

    fn load_id_set<T>(
        &self,
        sql: &str,
        parent_id: &str,
        parse: fn(&str) -> Option<T>,
    ) -> Result<Vec<T>, DomainError> {
        let mut stmt = self.conn.prepare(sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(params![parent_id], |row| row.get::<_, String>(0))
            .map_err(storage_err)?;

        let mut ids = Vec::new();
        for raw in rows {
            let raw = raw.map_err(storage_err)?;
            ids.push(parse_id(&raw, parse)?);
        }
        Ok(ids)
    }

    fn replace_inventory_sets(
        tx: &rusqlite::Transaction<'_>,
        id: &str,
        candidate: &InventoryCandidate,
    ) -> Result<(), DomainError> {
        tx.execute("DELETE FROM inventory_associate WHERE inventory_id = ?1", params![id])
            .map_err(storage_err)?;
        tx.execute("DELETE FROM inventory_weather WHERE inventory_id = ?1", params![id])
            .map_err(storage_err)?;

        let associates: BTreeSet<String> =
            candidate.associate_ids.iter().map(ToString::to_string).collect();
        for observer in &associates {
            tx.execute(
                "INSERT INTO inventory_associate(inventory_id, observer_id) VALUES (?1, ?2)",
                params![id, observer],
            )
            .map_err(storage_err)?;
        }

        let weathers: BTreeSet<String> =
            candidate.weather_ids.iter().map(ToString::to_string).collect();
        for weather in &weathers {
            tx.execute(
                "INSERT INTO inventory_weather(inventory_id, weather_id) VALUES (?1, ?2)",
                params![id, weather],
            )
            .map_err(storage_err)?;
        }

        Ok(())
    }

    fn replace_entry_sets(
        tx: &rusqlite::Transaction<'_>,
        id: &str,
        candidate: &EntryCandidate,
    ) -> Result<(), DomainError> {
        tx.execute("DELETE FROM entry_behavior WHERE entry_id = ?1", params![id])
            .map_err(storage_err)?;
        tx.execute("DELETE FROM entry_environment WHERE entry_id = ?1", params![id])
            .map_err(storage_err)?;

        let behaviors: BTreeSet<String> =
            candidate.behavior_ids.iter().map(ToString::to_string).collect();
        for behavior in &behaviors {
            tx.execute(
                "INSERT INTO entry_behavior(entry_id, behavior_id) VALUES (?1, ?2)",
                params![id, behavior],
            )
            .map_err(storage_err)?;
        }

        let environments: BTreeSet<String> =
            candidate.environment_ids.iter().map(ToString::to_string).collect();
        for environment in &environments {
            tx.execute(
                "INSERT INTO entry_environment(entry_id, environment_id) VALUES (?1, ?2)",
                params![id, environment],
            )
            .map_err(storage_err)?;
        }

        Ok(())
    }
}

impl LocalityLookup for SqliteStore {
    fn locality_by_id(&self, id: LocalityId) -> Result<Option<Locality>, DomainError> {
        ReferenceStore::<Locality>::reference_by_id(self, &id.to_string())
    }
}

impl InventoryRepository for SqliteStore {
    fn inventory_by_id(&self, id: InventoryId) -> Result<Option<Inventory>, DomainError> {
        self.load_inventory(&id.to_string())
    }

    fn inventories_matching_scalars(
        &self,
        key: &InventoryScalarKey,
    ) -> Result<Vec<Inventory>, DomainError> {
        // `IS` comparisons so absent optional fields match only absent ones.
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id FROM inventory
                 WHERE observer_id = ?1
                   AND date = ?2
                   AND time IS ?3
                   AND duration_minutes IS ?4
                   AND locality_id = ?5
                   AND custom_altitude IS ?6
                   AND custom_longitude IS ?7
                   AND custom_latitude IS ?8
                   AND custom_system IS ?9
                   AND temperature IS ?10
                 ORDER BY id ASC",
            )
            .map_err(storage_err)?;

        let time = key.time.map(time_to_text).transpose()?;
        let rows = stmt
            .query_map(
                params![
                    key.observer_id.to_string(),
                    date_to_text(key.date)?,
                    time,
                    key.duration_minutes,
                    key.locality_id.to_string(),
                    key.custom_coordinates.map(|c| c.altitude),
                    key.custom_coordinates.map(|c| c.longitude),
                    key.custom_coordinates.map(|c| c.latitude),
                    key.custom_coordinates.map(|c| c.system.as_str()),
                    key.temperature,
                ],
                |row| row.get::<_, String>(0),
            )
            .map_err(storage_err)?;

        let mut matches = Vec::new();
        for raw in rows {
            let raw = raw.map_err(storage_err)?;
            if let Some(inventory) = self.load_inventory(&raw)? {
                matches.push(inventory);
            }
        }
        Ok(matches)
    }

    fn insert_inventory(
        &mut self,
        candidate: &InventoryCandidate,
        owner_id: Option<UserId>,
    ) -> Result<Inventory, DomainError> {
        let id = InventoryId::new().to_string();
        let tx = self.conn.transaction().map_err(storage_err)?;

        let time = candidate.time.map(time_to_text).transpose()?;
        tx.execute(
            "INSERT INTO inventory(
                id, observer_id, date, time, duration_minutes, locality_id,
                custom_altitude, custom_longitude, custom_latitude, custom_system,
                temperature, owner_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id,
                candidate.observer_id.to_string(),
                date_to_text(candidate.date)?,
                time,
                candidate.duration_minutes,
                candidate.locality_id.to_string(),
                candidate.custom_coordinates.map(|c| c.altitude),
                candidate.custom_coordinates.map(|c| c.longitude),
                candidate.custom_coordinates.map(|c| c.latitude),
                candidate.custom_coordinates.map(|c| c.system.as_str()),
                candidate.temperature,
                owner_id.map(|owner| owner.to_string()),
            ],
        )
        .map_err(storage_err)?;

        Self::replace_inventory_sets(&tx, &id, candidate)?;
        tx.commit().map_err(storage_err)?;

        self.load_inventory(&id)?
            .ok_or_else(|| DomainError::Storage(format!("inventory vanished after insert: {id}")))
    }

    fn update_inventory(
        &mut self,
        id: InventoryId,
        candidate: &InventoryCandidate,
    ) -> Result<Inventory, DomainError> {
        let raw = id.to_string();
        let tx = self.conn.transaction().map_err(storage_err)?;

        let time = candidate.time.map(time_to_text).transpose()?;
        let changed = tx
            .execute(
                "UPDATE inventory SET
                    observer_id = ?2, date = ?3, time = ?4, duration_minutes = ?5,
                    locality_id = ?6, custom_altitude = ?7, custom_longitude = ?8,
                    custom_latitude = ?9, custom_system = ?10, temperature = ?11
                 WHERE id = ?1",
                params![
                    raw,
                    candidate.observer_id.to_string(),
                    date_to_text(candidate.date)?,
                    time,
                    candidate.duration_minutes,
                    candidate.locality_id.to_string(),
                    candidate.custom_coordinates.map(|c| c.altitude),
                    candidate.custom_coordinates.map(|c| c.longitude),
                    candidate.custom_coordinates.map(|c| c.latitude),
                    candidate.custom_coordinates.map(|c| c.system.as_str()),
                    candidate.temperature,
                ],
            )
            .map_err(storage_err)?;

        if changed == 0 {
            return Err(DomainError::NotFound { entity: "inventory", id: raw });
        }

        Self::replace_inventory_sets(&tx, &raw, candidate)?;
        tx.commit().map_err(storage_err)?;

        self.load_inventory(&raw)?
            .ok_or_else(|| DomainError::Storage(format!("inventory vanished after update: {raw}")))
    }

    fn delete_inventory(&mut self, id: InventoryId) -> Result<Option<Inventory>, DomainError> {
        let raw = id.to_string();
        let Some(existing) = self.load_inventory(&raw)? else {
            return Ok(None);
        };

        // Association rows cascade.
        self.conn
            .execute("DELETE FROM inventory WHERE id = ?1", params![raw])
            .map_err(storage_err)?;
        Ok(Some(existing))
    }
}

impl EntryRepository for SqliteStore {
    fn entry_by_id(&self, id: EntryId) -> Result<Option<Entry>, DomainError> {
        self.load_entry(&id.to_string())
    }

    fn entries_matching_scalars(&self, key: &EntryScalarKey) -> Result<Vec<Entry>, DomainError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id FROM entry
                 WHERE inventory_id = ?1
                   AND species_id = ?2
                   AND sex_id = ?3
                   AND age_id = ?4
                   AND number_estimate_id = ?5
                   AND number IS ?6
                   AND distance_estimate_id IS ?7
                   AND distance IS ?8
                   AND comment IS ?9
                 ORDER BY id ASC",
            )
            .map_err(storage_err)?;

        let rows = stmt
            .query_map(
                params![
                    key.inventory_id.to_string(),
                    key.species_id.to_string(),
                    key.sex_id.to_string(),
                    key.age_id.to_string(),
                    key.number_estimate_id.to_string(),
                    key.number,
                    key.distance_estimate_id.map(|id| id.to_string()),
                    key.distance,
                    key.comment,
                ],
                |row| row.get::<_, String>(0),
            )
            .map_err(storage_err)?;

        let mut matches = Vec::new();
        for raw in rows {
            let raw = raw.map_err(storage_err)?;
            if let Some(entry) = self.load_entry(&raw)? {
                matches.push(entry);
            }
        }
        Ok(matches)
    }

    fn insert_entry(
        &mut self,
        candidate: &EntryCandidate,
        owner_id: Option<UserId>,
    ) -> Result<Entry, DomainError> {
        let id = EntryId::new().to_string();
        let tx = self.conn.transaction().map_err(storage_err)?;

        tx.execute(
            "INSERT INTO entry(
                id, inventory_id, species_id, sex_id, age_id, number_estimate_id,
                number, distance_estimate_id, distance, comment, owner_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                candidate.inventory_id.to_string(),
                candidate.species_id.to_string(),
                candidate.sex_id.to_string(),
                candidate.age_id.to_string(),
                candidate.number_estimate_id.to_string(),
                candidate.number,
                candidate.distance_estimate_id.map(|d| d.to_string()),
                candidate.distance,
                candidate.comment,
                owner_id.map(|owner| owner.to_string()),
            ],
        )
        .map_err(storage_err)?;

        Self::replace_entry_sets(&tx, &id, candidate)?;
        tx.commit().map_err(storage_err)?;

        self.load_entry(&id)?
            .ok_or_else(|| DomainError::Storage(format!("entry vanished after insert: {id}")))
    }

    fn update_entry(
        &mut self,
        id: EntryId,
        candidate: &EntryCandidate,
    ) -> Result<Entry, DomainError> {
        let raw = id.to_string();
        let tx = self.conn.transaction().map_err(storage_err)?;

        let changed = tx
            .execute(
                "UPDATE entry SET
                    inventory_id = ?2, species_id = ?3, sex_id = ?4, age_id = ?5,
                    number_estimate_id = ?6, number = ?7, distance_estimate_id = ?8,
                    distance = ?9, comment = ?10
                 WHERE id = ?1",
                params![
                    raw,
                    candidate.inventory_id.to_string(),
                    candidate.species_id.to_string(),
                    candidate.sex_id.to_string(),
                    candidate.age_id.to_string(),
                    candidate.number_estimate_id.to_string(),
                    candidate.number,
                    candidate.distance_estimate_id.map(|d| d.to_string()),
                    candidate.distance,
                    candidate.comment,
                ],
            )
            .map_err(storage_err)?;

        if changed == 0 {
            return Err(DomainError::NotFound { entity: "entry", id: raw });
        }

        Self::replace_entry_sets(&tx, &raw, candidate)?;
        tx.commit().map_err(storage_err)?;

        self.load_entry(&raw)?
            .ok_or_else(|| DomainError::Storage(format!("entry vanished after update: {raw}")))
    }

    fn delete_entry(&mut self, id: EntryId) -> Result<Option<Entry>, DomainError> {
        let raw = id.to_string();
        let Some(existing) = self.load_entry(&raw)? else {
            return Ok(None);
        };

        self.conn.execute("DELETE FROM entry WHERE id = ?1", params![raw]).map_err(storage_err)?;
        Ok(Some(existing))
    }

    fn count_entries_for_inventory(&self, id: InventoryId) -> Result<u64, DomainError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM entry WHERE inventory_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        u64::try_from(count).map_err(|err| DomainError::Storage(err.to_string()))
    }

    fn repoint_entries(&mut self, from: InventoryId, to: InventoryId) -> Result<u64, DomainError> {
        let moved = self
            .conn
            .execute(
                "UPDATE entry SET inventory_id = ?2 WHERE inventory_id = ?1",
                params![from.to_string(), to.to_string()],
            )
            .map_err(storage_err)?;
        u64::try_from(moved).map_err(|err| DomainError::Storage(err.to_string()))
    }
}

macro_rules! label_store {
    ($entity:ident, $draft:ident, $id:ident, $table:literal, $usage_sql:literal) => {
        impl ReferenceStore<$entity> for SqliteStore {
            fn reference_by_id(&self, id: &str) -> Result<Option<$entity>, DomainError> {
                let row = self
                    .conn
                    .query_row(
                        concat!("SELECT id, label, owner_id FROM ", $table, " WHERE id = ?1"),
                        params![id],
                        label_row_mapper,
                    )
                    .optional()
                    .map_err(storage_err)?;
                row.map(|(id, label, owner)| {
                    Ok($entity {
                        id: parse_id(&id, $id::parse)?,
                        label,
                        owner_id: parse_owner(owner.as_deref())?,
                    })
                })
                .transpose()
            }

            fn reference_by_key(&self, folded_key: &str) -> Result<Option<$entity>, DomainError> {
                let row = self
                    .conn
                    .query_row(
                        concat!(
                            "SELECT id, label, owner_id FROM ",
                            $table,
                            " WHERE label_folded = ?1"
                        ),
                        params![folded_key],
                        label_row_mapper,
                    )
                    .optional()
                    .map_err(storage_err)?;
                row.map(|(id, label, owner)| {
                    Ok($entity {
                        id: parse_id(&id, $id::parse)?,
                        label,
                        owner_id: parse_owner(owner.as_deref())?,
                    })
                })
                .transpose()
            }

            fn list_references(&self) -> Result<Vec<$entity>, DomainError> {
                let mut stmt = self
                    .conn
                    .prepare(concat!(
                        "SELECT id, label, owner_id FROM ",
                        $table,
                        " ORDER BY label_folded ASC"
                    ))
                    .map_err(storage_err)?;
                let rows = stmt.query_map([], label_row_mapper).map_err(storage_err)?;

                let mut entities = Vec::new();
                for row in rows {
                    let (id, label, owner) = row.map_err(storage_err)?;
                    entities.push($entity {
                        id: parse_id(&id, $id::parse)?,
                        label,
                        owner_id: parse_owner(owner.as_deref())?,
                    });
                }
                Ok(entities)
            }

            fn insert_reference(
                &mut self,
                draft: &$draft,
                owner_id: Option<UserId>,
            ) -> Result<$entity, DomainError> {
                let id = $id::new();
                self.conn
                    .execute(
                        concat!(
                            "INSERT INTO ",
                            $table,
                            "(id, label, label_folded, owner_id) VALUES (?1, ?2, ?3, ?4)"
                        ),
                        params![
                            id.to_string(),
                            draft.label,
                            fold_text(&draft.label),
                            owner_id.map(|owner| owner.to_string()),
                        ],
                    )
                    .map_err(storage_err)?;
                Ok($entity { id, label: draft.label.clone(), owner_id })
            }

            fn update_reference(&mut self, id: &str, draft: &$draft) -> Result<$entity, DomainError> {
                let changed = self
                    .conn
                    .execute(
                        concat!(
                            "UPDATE ",
                            $table,
                            " SET label = ?2, label_folded = ?3 WHERE id = ?1"
                        ),
                        params![id, draft.label, fold_text(&draft.label)],
                    )
                    .map_err(storage_err)?;
                if changed == 0 {
                    return Err(DomainError::NotFound {
                        entity: $entity::NOUN,
                        id: id.to_string(),
                    });
                }
                ReferenceStore::<$entity>::reference_by_id(self, id)?.ok_or_else(|| {
                    DomainError::Storage(format!("row vanished after update: {id}"))
                })
            }

            fn delete_reference(&mut self, id: &str) -> Result<Option<$entity>, DomainError> {
                let Some(existing) = ReferenceStore::<$entity>::reference_by_id(self, id)? else {
                    return Ok(None);
                };
                self.conn
                    .execute(concat!("DELETE FROM ", $table, " WHERE id = ?1"), params![id])
                    .map_err(storage_err)?;
                Ok(Some(existing))
            }

            fn reference_usage(&self, id: &str) -> Result<u64, DomainError> {
                let count: i64 = self
                    .conn
                    .query_row($usage_sql, params![id], |row| row.get(0))
                    .map_err(storage_err)?;
                u64::try_from(count).map_err(|err| DomainError::Storage(err.to_string()))
            }
        }
    };
}

label_store!(
    Observer,
    ObserverDraft,
    ObserverId,
    "observer",
    "SELECT (SELECT COUNT(*) FROM inventory WHERE observer_id = ?1)
          + (SELECT COUNT(*) FROM inventory_associate WHERE observer_id = ?1)"
);
label_store!(
    SpeciesClass,
    SpeciesClassDraft,
    SpeciesClassId,
    "species_class",
    "SELECT COUNT(*) FROM species WHERE species_class_id = ?1"
);
label_store!(Sex, SexDraft, SexId, "sex", "SELECT COUNT(*) FROM entry WHERE sex_id = ?1");
label_store!(Age, AgeDraft, AgeId, "age", "SELECT COUNT(*) FROM entry WHERE age_id = ?1");
label_store!(
    NumberEstimate,
    NumberEstimateDraft,
    NumberEstimateId,
    "number_estimate",
    "SELECT COUNT(*) FROM entry WHERE number_estimate_id = ?1"
);
label_store!(
    DistanceEstimate,
    DistanceEstimateDraft,
    DistanceEstimateId,
    "distance_estimate",
    "SELECT COUNT(*) FROM entry WHERE distance_estimate_id = ?1"
);
label_store!(
    Weather,
    WeatherDraft,
    WeatherId,
    "weather",
    "SELECT COUNT(*) FROM inventory_weather WHERE weather_id = ?1"
);

impl ReferenceStore<Department> for SqliteStore {
    fn reference_by_id(&self, id: &str) -> Result<Option<Department>, DomainError> {
        self.conn
            .query_row(
                "SELECT id, code, owner_id FROM department WHERE id = ?1",
                params![id],
                label_row_mapper,
            )
            .optional()
            .map_err(storage_err)?
            .map(department_from_row)
            .transpose()
    }

    fn reference_by_key(&self, folded_key: &str) -> Result<Option<Department>, DomainError> {
        self.conn
            .query_row(
                "SELECT id, code, owner_id FROM department WHERE code_folded = ?1",
                params![folded_key],
                label_row_mapper,
            )
            .optional()
            .map_err(storage_err)?
            .map(department_from_row)
            .transpose()
    }

    fn list_references(&self) -> Result<Vec<Department>, DomainError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, code, owner_id FROM department ORDER BY code_folded ASC")
            .map_err(storage_err)?;
        let rows = stmt.query_map([], label_row_mapper).map_err(storage_err)?;

        let mut departments = Vec::new();
        for row in rows {
            departments.push(department_from_row(row.map_err(storage_err)?)?);
        }
        Ok(departments)
    }

    fn insert_reference(
        &mut self,
        draft: &DepartmentDraft,
        owner_id: Option<UserId>,
    ) -> Result<Department, DomainError> {
        let id = DepartmentId::new();
        self.conn
            .execute(
                "INSERT INTO department(id, code, code_folded, owner_id) VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.to_string(),
                    draft.code,
                    fold_text(&draft.code),
                    owner_id.map(|owner| owner.to_string()),
                ],
            )
            .map_err(storage_err)?;
        Ok(Department { id, code: draft.code.clone(), owner_id })
    }

    fn update_reference(&mut self, id: &str, draft: &DepartmentDraft) -> Result<Department, DomainError> {
        let changed = self
            .conn
            .execute(
                "UPDATE department SET code = ?2, code_folded = ?3 WHERE id = ?1",
                params![id, draft.code, fold_text(&draft.code)],
            )
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(DomainError::NotFound { entity: Department::NOUN, id: id.to_string() });
        }
        ReferenceStore::<Department>::reference_by_id(self, id)?
            .ok_or_else(|| DomainError::Storage(format!("row vanished after update: {id}")))
    }

    fn delete_reference(&mut self, id: &str) -> Result<Option<Department>, DomainError> {
        let Some(existing) = ReferenceStore::<Department>::reference_by_id(self, id)? else {
            return Ok(None);
        };
        self.conn
            .execute("DELETE FROM department WHERE id = ?1", params![id])
            .map_err(storage_err)?;
        Ok(Some(existing))
    }

    fn reference_usage(&self, id: &str) -> Result<u64, DomainError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM town WHERE department_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        u64::try_from(count).map_err(|err| DomainError::Storage(err.to_string()))
    }
}

impl ReferenceStore<Town> for SqliteStore {
    fn reference_by_id(&self, id: &str) -> Result<Option<Town>, DomainError> {
        self.conn
            .query_row(
                "SELECT id, department_id, code, name, owner_id FROM town WHERE id = ?1",
                params![id],
                town_row_mapper,
            )
            .optional()
            .map_err(storage_err)?
            .map(town_from_row)
            .transpose()
    }

    fn reference_by_key(&self, folded_key: &str) -> Result<Option<Town>, DomainError> {
        self.conn
            .query_row(
                "SELECT id, department_id, code, name, owner_id FROM town WHERE key_folded = ?1",
                params![folded_key],
                town_row_mapper,
            )
            .optional()
            .map_err(storage_err)?
            .map(town_from_row)
            .transpose()
    }

    fn list_references(&self) -> Result<Vec<Town>, DomainError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, department_id, code, name, owner_id FROM town ORDER BY name_folded ASC",
            )
            .map_err(storage_err)?;
        let rows = stmt.query_map([], town_row_mapper).map_err(storage_err)?;

        let mut towns = Vec::new();
        for row in rows {
            towns.push(town_from_row(row.map_err(storage_err)?)?);
        }
        Ok(towns)
    }

    fn insert_reference(
        &mut self,
        draft: &TownDraft,
        owner_id: Option<UserId>,
    ) -> Result<Town, DomainError> {
        let id = TownId::new();
        self.conn
            .execute(
                "INSERT INTO town(id, department_id, code, name, name_folded, key_folded, owner_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.to_string(),
                    draft.department_id.to_string(),
                    draft.code,
                    draft.name,
                    fold_text(&draft.name),
                    fold_text(&format!("{}|{}", draft.department_id, draft.name)),
                    owner_id.map(|owner| owner.to_string()),
                ],
            )
            .map_err(storage_err)?;
        Ok(Town {
            id,
            department_id: draft.department_id,
            code: draft.code,
            name: draft.name.clone(),
            owner_id,
        })
    }

    fn update_reference(&mut self, id: &str, draft: &TownDraft) -> Result<Town, DomainError> {
        let changed = self
            .conn
            .execute(
                "UPDATE town SET department_id = ?2, code = ?3, name = ?4, name_folded = ?5, key_folded = ?6
                 WHERE id = ?1",
                params![
                    id,
                    draft.department_id.to_string(),
                    draft.code,
                    draft.name,
                    fold_text(&draft.name),
                    fold_text(&format!("{}|{}", draft.department_id, draft.name)),
                ],
            )
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(DomainError::NotFound { entity: Town::NOUN, id: id.to_string() });
        }
        ReferenceStore::<Town>::reference_by_id(self, id)?
            .ok_or_else(|| DomainError::Storage(format!("row vanished after update: {id}")))
    }

    fn delete_reference(&mut self, id: &str) -> Result<Option<Town>, DomainError> {
        let Some(existing) = ReferenceStore::<Town>::reference_by_id(self, id)? else {
            return Ok(None);
        };
        self.conn.execute("DELETE FROM town WHERE id = ?1", params![id]).map_err(storage_err)?;
        Ok(Some(existing))
    }

    fn reference_usage(&self, id: &str) -> Result<u64, DomainError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM locality WHERE town_id = ?1", params![id], |row| {
                row.get(0)
            })
            .map_err(storage_err)?;
        u64::try_from(count).map_err(|err| DomainError::Storage(err.to_string()))
    }
}

impl ReferenceStore<Locality> for SqliteStore {
    fn reference_by_id(&self, id: &str) -> Result<Option<Locality>, DomainError> {
        self.conn
            .query_row(
                "SELECT id, town_id, name, altitude, longitude, latitude, coordinates_system, owner_id
                 FROM locality WHERE id = ?1",
                params![id],
                locality_row_mapper,
            )
            .optional()
            .map_err(storage_err)?
            .map(locality_from_row)
            .transpose()
    }

    fn reference_by_key(&self, folded_key: &str) -> Result<Option<Locality>, DomainError> {
        self.conn
            .query_row(
                "SELECT id, town_id, name, altitude, longitude, latitude, coordinates_system, owner_id
                 FROM locality WHERE key_folded = ?1",
                params![folded_key],
                locality_row_mapper,
            )
            .optional()
            .map_err(storage_err)?
            .map(locality_from_row)
            .transpose()
    }

    fn list_references(&self) -> Result<Vec<Locality>, DomainError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, town_id, name, altitude, longitude, latitude, coordinates_system, owner_id
                 FROM locality ORDER BY name_folded ASC",
            )
            .map_err(storage_err)?;
        let rows = stmt.query_map([], locality_row_mapper).map_err(storage_err)?;

        let mut localities = Vec::new();
        for row in rows {
            localities.push(locality_from_row(row.map_err(storage_err)?)?);
        }
        Ok(localities)
    }

    fn insert_reference(
        &mut self,
        draft: &LocalityDraft,
        owner_id: Option<UserId>,
    ) -> Result<Locality, DomainError> {
        let id = LocalityId::new();
        self.conn
            .execute(
                "INSERT INTO locality(
                    id, town_id, name, name_folded, key_folded,
                    altitude, longitude, latitude, coordinates_system, owner_id
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id.to_string(),
                    draft.town_id.to_string(),
                    draft.name,
                    fold_text(&draft.name),
                    fold_text(&format!("{}|{}", draft.town_id, draft.name)),
                    draft.coordinates.altitude,
                    draft.coordinates.longitude,
                    draft.coordinates.latitude,
                    draft.coordinates.system.as_str(),
                    owner_id.map(|owner| owner.to_string()),
                ],
            )
            .map_err(storage_err)?;
        Ok(Locality {
            id,
            town_id: draft.town_id,
            name: draft.name.clone(),
            coordinates: draft.coordinates,
            owner_id,
        })
    }

    fn update_reference(&mut self, id: &str, draft: &LocalityDraft) -> Result<Locality, DomainError> {
        let changed = self
            .conn
            .execute(
                "UPDATE locality SET
                    town_id = ?2, name = ?3, name_folded = ?4, key_folded = ?5,
                    altitude = ?6, longitude = ?7, latitude = ?8, coordinates_system = ?9
                 WHERE id = ?1",
                params![
                    id,
                    draft.town_id.to_string(),
                    draft.name,
                    fold_text(&draft.name),
                    fold_text(&format!("{}|{}", draft.town_id, draft.name)),
                    draft.coordinates.altitude,
                    draft.coordinates.longitude,
                    draft.coordinates.latitude,
                    draft.coordinates.system.as_str(),
                ],
            )
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(DomainError::NotFound { entity: Locality::NOUN, id: id.to_string() });
        }
        ReferenceStore::<Locality>::reference_by_id(self, id)?
            .ok_or_else(|| DomainError::Storage(format!("row vanished after update: {id}")))
    }

    fn delete_reference(&mut self, id: &str) -> Result<Option<Locality>, DomainError> {
        let Some(existing) = ReferenceStore::<Locality>::reference_by_id(self, id)? else {
            return Ok(None);
        };
        self.conn
            .execute("DELETE FROM locality WHERE id = ?1", params![id])
            .map_err(storage_err)?;
        Ok(Some(existing))
    }

    fn reference_usage(&self, id: &str) -> Result<u64, DomainError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM inventory WHERE locality_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        u64::try_from(count).map_err(|err| DomainError::Storage(err.to_string()))
    }
}

impl ReferenceStore<Species> for SqliteStore {
    fn reference_by_id(&self, id: &str) -> Result<Option<Species>, DomainError> {
        self.conn
            .query_row(
                "SELECT id, species_class_id, code, name, latin_name, owner_id
                 FROM species WHERE id = ?1",
                params![id],
                species_row_mapper,
            )
            .optional()
            .map_err(storage_err)?
            .map(species_from_row)
            .transpose()
    }

    fn reference_by_key(&self, folded_key: &str) -> Result<Option<Species>, DomainError> {
        self.conn
            .query_row(
                "SELECT id, species_class_id, code, name, latin_name, owner_id
                 FROM species WHERE code_folded = ?1",
                params![folded_key],
                species_row_mapper,
            )
            .optional()
            .map_err(storage_err)?
            .map(species_from_row)
            .transpose()
    }

    fn list_references(&self) -> Result<Vec<Species>, DomainError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, species_class_id, code, name, latin_name, owner_id
                 FROM species ORDER BY code_folded ASC",
            )
            .map_err(storage_err)?;
        let rows = stmt.query_map([], species_row_mapper).map_err(storage_err)?;

        let mut all = Vec::new();
        for row in rows {
            all.push(species_from_row(row.map_err(storage_err)?)?);
        }
        Ok(all)
    }

    fn insert_reference(
        &mut self,
        draft: &SpeciesDraft,
        owner_id: Option<UserId>,
    ) -> Result<Species, DomainError> {
        let id = SpeciesId::new();
        self.conn
            .execute(
                "INSERT INTO species(
                    id, species_class_id, code, code_folded,
                    name, name_folded, latin_name, latin_name_folded, owner_id
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.to_string(),
                    draft.species_class_id.to_string(),
                    draft.code,
                    fold_text(&draft.code),
                    draft.name,
                    fold_text(&draft.name),
                    draft.latin_name,
                    fold_text(&draft.latin_name),
                    owner_id.map(|owner| owner.to_string()),
                ],
            )
            .map_err(storage_err)?;
        Ok(Species {
            id,
            species_class_id: draft.species_class_id,
            code: draft.code.clone(),
            name: draft.name.clone(),
            latin_name: draft.latin_name.clone(),
            owner_id,
        })
    }

    fn update_reference(&mut self, id: &str, draft: &SpeciesDraft) -> Result<Species, DomainError> {
        let changed = self
            .conn
            .execute(
                "UPDATE species SET
                    species_class_id = ?2, code = ?3, code_folded = ?4,
                    name = ?5, name_folded = ?6, latin_name = ?7, latin_name_folded = ?8
                 WHERE id = ?1",
                params![
                    id,
                    draft.species_class_id.to_string(),
                    draft.code,
                    fold_text(&draft.code),
                    draft.name,
                    fold_text(&draft.name),
                    draft.latin_name,
                    fold_text(&draft.latin_name),
                ],
            )
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(DomainError::NotFound { entity: Species::NOUN, id: id.to_string() });
        }
        ReferenceStore::<Species>::reference_by_id(self, id)?
            .ok_or_else(|| DomainError::Storage(format!("row vanished after update: {id}")))
    }

    fn delete_reference(&mut self, id: &str) -> Result<Option<Species>, DomainError> {
        let Some(existing) = ReferenceStore::<Species>::reference_by_id(self, id)? else {
            return Ok(None);
        };
        self.conn
            .execute("DELETE FROM species WHERE id = ?1", params![id])
            .map_err(storage_err)?;
        Ok(Some(existing))
    }

    fn reference_usage(&self, id: &str) -> Result<u64, DomainError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM entry WHERE species_id = ?1", params![id], |row| {
                row.get(0)
            })
            .map_err(storage_err)?;
        u64::try_from(count).map_err(|err| DomainError::Storage(err.to_string()))
    }
}

impl ReferenceStore<Behavior> for SqliteStore {
    fn reference_by_id(&self, id: &str) -> Result<Option<Behavior>, DomainError> {
        self.conn
            .query_row(
                "SELECT id, code, label, breeding_status, owner_id FROM behavior WHERE id = ?1",
                params![id],
                behavior_row_mapper,
            )
            .optional()
            .map_err(storage_err)?
            .map(behavior_from_row)
            .transpose()
    }

    fn reference_by_key(&self, folded_key: &str) -> Result<Option<Behavior>, DomainError> {
        self.conn
            .query_row(
                "SELECT id, code, label, breeding_status, owner_id FROM behavior WHERE code_folded = ?1",
                params![folded_key],
                behavior_row_mapper,
            )
            .optional()
            .map_err(storage_err)?
            .map(behavior_from_row)
            .transpose()
    }

    fn list_references(&self) -> Result<Vec<Behavior>, DomainError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, code, label, breeding_status, owner_id FROM behavior ORDER BY code_folded ASC",
            )
            .map_err(storage_err)?;
        let rows = stmt.query_map([], behavior_row_mapper).map_err(storage_err)?;

        let mut behaviors = Vec::new();
        for row in rows {
            behaviors.push(behavior_from_row(row.map_err(storage_err)?)?);
        }
        Ok(behaviors)
    }

    fn insert_reference(
        &mut self,
        draft: &BehaviorDraft,
        owner_id: Option<UserId>,
    ) -> Result<Behavior, DomainError> {
        let id = BehaviorId::new();
        self.conn
            .execute(
                "INSERT INTO behavior(id, code, code_folded, label, label_folded, breeding_status, owner_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.to_string(),
                    draft.code,
                    fold_text(&draft.code),
                    draft.label,
                    fold_text(&draft.label),
                    draft.breeding_status.map(BreedingStatus::as_str),
                    owner_id.map(|owner| owner.to_string()),
                ],
            )
            .map_err(storage_err)?;
        Ok(Behavior {
            id,
            code: draft.code.clone(),
            label: draft.label.clone(),
            breeding_status: draft.breeding_status,
            owner_id,
        })
    }

    fn update_reference(&mut self, id: &str, draft: &BehaviorDraft) -> Result<Behavior, DomainError> {
        let changed = self
            .conn
            .execute(
                "UPDATE behavior SET
                    code = ?2, code_folded = ?3, label = ?4, label_folded = ?5, breeding_status = ?6
                 WHERE id = ?1",
                params![
                    id,
                    draft.code,
                    fold_text(&draft.code),
                    draft.label,
                    fold_text(&draft.label),
                    draft.breeding_status.map(BreedingStatus::as_str),
                ],
            )
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(DomainError::NotFound { entity: Behavior::NOUN, id: id.to_string() });
        }
        ReferenceStore::<Behavior>::reference_by_id(self, id)?
            .ok_or_else(|| DomainError::Storage(format!("row vanished after update: {id}")))
    }

    fn delete_reference(&mut self, id: &str) -> Result<Option<Behavior>, DomainError> {
        let Some(existing) = ReferenceStore::<Behavior>::reference_by_id(self, id)? else {
            return Ok(None);
        };
        self.conn
            .execute("DELETE FROM behavior WHERE id = ?1", params![id])
            .map_err(storage_err)?;
        Ok(Some(existing))
    }

    fn reference_usage(&self, id: &str) -> Result<u64, DomainError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM entry_behavior WHERE behavior_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        u64::try_from(count).map_err(|err| DomainError::Storage(err.to_string()))
    }
}

impl ReferenceStore<Environment> for SqliteStore {
    fn reference_by_id(&self, id: &str) -> Result<Option<Environment>, DomainError> {
        self.conn
            .query_row(
                "SELECT id, code, label, owner_id FROM environment WHERE id = ?1",
                params![id],
                environment_row_mapper,
            )
            .optional()
            .map_err(storage_err)?
            .map(environment_from_row)
            .transpose()
    }

    fn reference_by_key(&self, folded_key: &str) -> Result<Option<Environment>, DomainError> {
        self.conn
            .query_row(
                "SELECT id, code, label, owner_id FROM environment WHERE code_folded = ?1",
                params![folded_key],
                environment_row_mapper,
            )
            .optional()
            .map_err(storage_err)?
            .map(environment_from_row)
            .transpose()
    }

    fn list_references(&self) -> Result<Vec<Environment>, DomainError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, code, label, owner_id FROM environment ORDER BY code_folded ASC")
            .map_err(storage_err)?;
        let rows = stmt.query_map([], environment_row_mapper).map_err(storage_err)?;

        let mut environments = Vec::new();
        for row in rows {
            environments.push(environment_from_row(row.map_err(storage_err)?)?);
        }
        Ok(environments)
    }

    fn insert_reference(
        &mut self,
        draft: &EnvironmentDraft,
        owner_id: Option<UserId>,
    ) -> Result<Environment, DomainError> {
        let id = EnvironmentId::new();
        self.conn
            .execute(
                "INSERT INTO environment(id, code, code_folded, label, label_folded, owner_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    draft.code,
                    fold_text(&draft.code),
                    draft.label,
                    fold_text(&draft.label),
                    owner_id.map(|owner| owner.to_string()),
                ],
            )
            .map_err(storage_err)?;
        Ok(Environment {
            id,
            code: draft.code.clone(),
            label: draft.label.clone(),
            owner_id,
        })
    }

    fn update_reference(&mut self, id: &str, draft: &EnvironmentDraft) -> Result<Environment, DomainError> {
        let changed = self
            .conn
            .execute(
                "UPDATE environment SET code = ?2, code_folded = ?3, label = ?4, label_folded = ?5
                 WHERE id = ?1",
                params![
                    id,
                    draft.code,
                    fold_text(&draft.code),
                    draft.label,
                    fold_text(&draft.label),
                ],
            )
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(DomainError::NotFound { entity: Environment::NOUN, id: id.to_string() });
        }
        ReferenceStore::<Environment>::reference_by_id(self, id)?
            .ok_or_else(|| DomainError::Storage(format!("row vanished after update: {id}")))
    }

    fn delete_reference(&mut self, id: &str) -> Result<Option<Environment>, DomainError> {
        let Some(existing) = ReferenceStore::<Environment>::reference_by_id(self, id)? else {
            return Ok(None);
        };
        self.conn
            .execute("DELETE FROM environment WHERE id = ?1", params![id])
            .map_err(storage_err)?;
        Ok(Some(existing))
    }

    fn reference_usage(&self, id: &str) -> Result<u64, DomainError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM entry_environment WHERE environment_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        u64::try_from(count).map_err(|err| DomainError::Storage(err.to_string()))
    }
}

struct InventoryRow {
    id: String,
    observer_id: String,
    date: String,
    time: Option<String>,
    duration_minutes: Option<u16>,
    locality_id: String,
    custom_altitude: Option<i32>,
    custom_longitude: Option<f64>,
    custom_latitude: Option<f64>,
    custom_system: Option<String>,
    temperature: Option<i16>,
    owner_id: Option<String>,
}

struct EntryRow {
    id: String,
    inventory_id: String,
    species_id: String,
    sex_id: String,
    age_id: String,
    number_estimate_id: String,
    number: Option<u32>,
    distance_estimate_id: Option<String>,
    distance: Option<u32>,
    comment: Option<String>,
    owner_id: Option<String>,
}

type LabelRow = (String, String, Option<String>);

fn label_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<LabelRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn department_from_row((id, code, owner): LabelRow) -> Result<Department, DomainError> {
    Ok(Department {
        id: parse_id(&id, DepartmentId::parse)?,
        code,
        owner_id: parse_owner(owner.as_deref())?,
    })
}

type TownRow = (String, String, u32, String, Option<String>);

fn town_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<TownRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn town_from_row((id, department_id, code, name, owner): TownRow) -> Result<Town, DomainError> {
    Ok(Town {
        id: parse_id(&id, TownId::parse)?,
        department_id: parse_id(&department_id, DepartmentId::parse)?,
        code,
        name,
        owner_id: parse_owner(owner.as_deref())?,
    })
}

type LocalityRow = (String, String, String, i32, f64, f64, String, Option<String>);

fn locality_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalityRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn locality_from_row(
    (id, town_id, name, altitude, longitude, latitude, system, owner): LocalityRow,
) -> Result<Locality, DomainError> {
    let system = CoordinatesSystem::parse(&system)
        .ok_or_else(|| DomainError::Storage(format!("invalid coordinates system: {system}")))?;
    Ok(Locality {
        id: parse_id(&id, LocalityId::parse)?,
        town_id: parse_id(&town_id, TownId::parse)?,
        name,
        coordinates: Coordinates { altitude, longitude, latitude, system },
        owner_id: parse_owner(owner.as_deref())?,
    })
}

fn coordinates_from_parts(
    altitude: Option<i32>,
    longitude: Option<f64>,
    latitude: Option<f64>,
    system: Option<&str>,
) -> Result<Option<Coordinates>, DomainError> {
    match (altitude, longitude, latitude, system) {
        (None, None, None, None) => Ok(None),
        (Some(altitude), Some(longitude), Some(latitude), Some(system)) => {
            let system = CoordinatesSystem::parse(system).ok_or_else(|| {
                DomainError::Storage(format!("invalid coordinates system: {system}"))
            })?;
            Ok(Some(Coordinates { altitude, longitude, latitude, system }))
        }
        _ => Err(DomainError::Storage(
            "inconsistent custom coordinates columns".to_string(),
        )),
    }
}

type SpeciesRow = (String, String, String, String, String, Option<String>);

fn species_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<SpeciesRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn species_from_row(
    (id, species_class_id, code, name, latin_name, owner): SpeciesRow,
) -> Result<Species, DomainError> {
    Ok(Species {
        id: parse_id(&id, SpeciesId::parse)?,
        species_class_id: parse_id(&species_class_id, SpeciesClassId::parse)?,
        code,
        name,
        latin_name,
        owner_id: parse_owner(owner.as_deref())?,
    })
}

type BehaviorRow = (String, String, String, Option<String>, Option<String>);

fn behavior_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<BehaviorRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn behavior_from_row(
    (id, code, label, breeding, owner): BehaviorRow,
) -> Result<Behavior, DomainError> {
    let breeding_status = breeding
        .as_deref()
        .map(|raw| {
            BreedingStatus::parse(raw)
                .ok_or_else(|| DomainError::Storage(format!("invalid breeding status: {raw}")))
        })
        .transpose()?;
    Ok(Behavior {
        id: parse_id(&id, BehaviorId::parse)?,
        code,
        label,
        breeding_status,
        owner_id: parse_owner(owner.as_deref())?,
    })
}

type EnvironmentRow = (String, String, String, Option<String>);

fn environment_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<EnvironmentRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn environment_from_row(
    (id, code, label, owner): EnvironmentRow,
) -> Result<Environment, DomainError> {
    Ok(Environment {
        id: parse_id(&id, EnvironmentId::parse)?,
        code,
        label,
        owner_id: parse_owner(owner.as_deref())?,
    })
}

struct SearchColumns {
    table: &'static str,
    display: &'static str,
    primary_folded: &'static str,
    secondary_folded: &'static [&'static str],
}

fn reference_search_columns(kind: EntityKind) -> Option<SearchColumns> {
    let columns = match kind {
        EntityKind::Observer => SearchColumns {
            table: "observer",
            display: "label",
            primary_folded: "label_folded",
            secondary_folded: &[],
        },
        EntityKind::SpeciesClass => SearchColumns {
            table: "species_class",
            display: "label",
            primary_folded: "label_folded",
            secondary_folded: &[],
        },
        EntityKind::Sex => SearchColumns {
            table: "sex",
            display: "label",
            primary_folded: "label_folded",
            secondary_folded: &[],
        },
        EntityKind::Age => SearchColumns {
            table: "age",
            display: "label",
            primary_folded: "label_folded",
            secondary_folded: &[],
        },
        EntityKind::NumberEstimate => SearchColumns {
            table: "number_estimate",
            display: "label",
            primary_folded: "label_folded",
            secondary_folded: &[],
        },
        EntityKind::DistanceEstimate => SearchColumns {
            table: "distance_estimate",
            display: "label",
            primary_folded: "label_folded",
            secondary_folded: &[],
        },
        EntityKind::Weather => SearchColumns {
            table: "weather",
            display: "label",
            primary_folded: "label_folded",
            secondary_folded: &[],
        },
        EntityKind::Department => SearchColumns {
            table: "department",
            display: "code",
            primary_folded: "code_folded",
            secondary_folded: &[],
        },
        EntityKind::Town => SearchColumns {
            table: "town",
            display: "name",
            primary_folded: "name_folded",
            secondary_folded: &[],
        },
        EntityKind::Locality => SearchColumns {
            table: "locality",
            display: "name",
            primary_folded: "name_folded",
            secondary_folded: &[],
        },
        EntityKind::Species => SearchColumns {
            table: "species",
            display: "name",
            primary_folded: "code_folded",
            secondary_folded: &["name_folded", "latin_name_folded"],
        },
        EntityKind::Behavior => SearchColumns {
            table: "behavior",
            display: "label",
            primary_folded: "code_folded",
            secondary_folded: &["label_folded"],
        },
        EntityKind::Environment => SearchColumns {
            table: "environment",
            display: "label",
            primary_folded: "code_folded",
            secondary_folded: &["label_folded"],
        },
        EntityKind::Inventory | EntityKind::Entry => return None,
    };
    Some(columns)
}

fn entry_join_sql(join: EntryJoin) -> &'static str {
    match join {
        EntryJoin::Inventory => " JOIN inventory ON inventory.id = entry.inventory_id",
        EntryJoin::Locality => " JOIN locality ON locality.id = inventory.locality_id",
        EntryJoin::Town => " JOIN town ON town.id = locality.town_id",
        EntryJoin::Species => " JOIN species ON species.id = entry.species_id",
        EntryJoin::EntryBehavior => " JOIN entry_behavior ON entry_behavior.entry_id = entry.id",
        EntryJoin::Behavior => " JOIN behavior ON behavior.id = entry_behavior.behavior_id",
        EntryJoin::EntryEnvironment => {
            " JOIN entry_environment ON entry_environment.entry_id = entry.id"
        }
        EntryJoin::InventoryAssociate => {
            " JOIN inventory_associate ON inventory_associate.inventory_id = inventory.id"
        }
        EntryJoin::InventoryWeather => {
            " JOIN inventory_weather ON inventory_weather.inventory_id = inventory.id"
        }
    }
}

fn in_clause(column: &str, len: usize) -> String {
    let placeholders = vec!["?"; len].join(", ");
    format!("{column} IN ({placeholders})")
}

fn push_id_list<T: std::fmt::Display>(
    column: &str,
    ids: &[T],
    where_parts: &mut Vec<String>,
    values: &mut Vec<Value>,
) {
    where_parts.push(in_clause(column, ids.len()));
    for id in ids {
        values.push(Value::Text(id.to_string()));
    }
}

fn render_entry_query(
    plan: &EntryQueryPlan,
    select: &str,
) -> Result<(String, Vec<Value>), DomainError> {
    let mut sql = format!("{select} FROM entry");
    // BTreeSet order puts every joined table after the tables it references.
    for join in &plan.joins {
        sql.push_str(entry_join_sql(*join));
    }

    let mut where_parts = Vec::new();
    let mut values = Vec::new();
    for filter in &plan.filters {
        match filter {
            EntryFilter::SpeciesIn(ids) => {
                push_id_list("entry.species_id", ids, &mut where_parts, &mut values);
            }
            EntryFilter::SpeciesClassIn(ids) => {
                push_id_list("species.species_class_id", ids, &mut where_parts, &mut values);
            }
            EntryFilter::SexIn(ids) => {
                push_id_list("entry.sex_id", ids, &mut where_parts, &mut values);
            }
            EntryFilter::AgeIn(ids) => {
                push_id_list("entry.age_id", ids, &mut where_parts, &mut values);
            }
            EntryFilter::NumberEstimateIn(ids) => {
                push_id_list("entry.number_estimate_id", ids, &mut where_parts, &mut values);
            }
            EntryFilter::DistanceEstimateIn(ids) => {
                push_id_list("entry.distance_estimate_id", ids, &mut where_parts, &mut values);
            }
            EntryFilter::LocalityIn(ids) => {
                push_id_list("inventory.locality_id", ids, &mut where_parts, &mut values);
            }
            EntryFilter::TownIn(ids) => {
                push_id_list("locality.town_id", ids, &mut where_parts, &mut values);
            }
            EntryFilter::DepartmentIn(ids) => {
                push_id_list("town.department_id", ids, &mut where_parts, &mut values);
            }
            EntryFilter::ObserverIn(ids) => {
                push_id_list("inventory.observer_id", ids, &mut where_parts, &mut values);
            }
            EntryFilter::AssociateIn(ids) => {
                push_id_list("inventory_associate.observer_id", ids, &mut where_parts, &mut values);
            }
            EntryFilter::WeatherIn(ids) => {
                push_id_list("inventory_weather.weather_id", ids, &mut where_parts, &mut values);
            }
            EntryFilter::BehaviorIn(ids) => {
                push_id_list("entry_behavior.behavior_id", ids, &mut where_parts, &mut values);
            }
            EntryFilter::EnvironmentIn(ids) => {
                push_id_list(
                    "entry_environment.environment_id",
                    ids,
                    &mut where_parts,
                    &mut values,
                );
            }
            EntryFilter::Breeding(status) => {
                where_parts.push("behavior.breeding_status = ?".to_string());
                values.push(Value::Text(status.as_str().to_string()));
            }
            EntryFilter::Text(needle) => {
                where_parts.push(
                    "(species.code_folded LIKE ? ESCAPE '\\'
                      OR species.name_folded LIKE ? ESCAPE '\\'
                      OR species.latin_name_folded LIKE ? ESCAPE '\\')"
                        .to_string(),
                );
                let pattern = format!("%{}%", escape_like(needle));
                values.push(Value::Text(pattern.clone()));
                values.push(Value::Text(pattern.clone()));
                values.push(Value::Text(pattern));
            }
            EntryFilter::DateFrom(from) => {
                where_parts.push("inventory.date >= ?".to_string());
                values.push(Value::Text(date_to_text(*from)?));
            }
            EntryFilter::DateTo(to) => {
                where_parts.push("inventory.date <= ?".to_string());
                values.push(Value::Text(date_to_text(*to)?));
            }
            EntryFilter::Owner(owner) => {
                where_parts.push("entry.owner_id = ?".to_string());
                values.push(Value::Text(owner.to_string()));
            }
        }
    }

    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }

    Ok((sql, values))
}

fn import_label_row(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    id: &str,
    label: &str,
    owner_id: Option<UserId>,
) -> Result<bool> {
    let inserted = tx
        .execute(
            &format!("INSERT OR IGNORE INTO {table}(id, label, label_folded, owner_id) VALUES (?1, ?2, ?3, ?4)"),
            params![id, label, fold_text(label), owner_id.map(|owner| owner.to_string())],
        )
        .with_context(|| format!("failed to import {table} row {id}"))?;
    Ok(inserted > 0)
}

fn tally_reference(
    inserted: bool,
    summary: &mut ImportSummary,
    skip_existing: bool,
    table: &str,
    id: &str,
) -> Result<()> {
    if inserted {
        summary.imported_references += 1;
        return Ok(());
    }
    if skip_existing {
        summary.skipped_existing_references += 1;
        return Ok(());
    }
    Err(anyhow!("{table} row already exists: {id}"))
}

fn import_inventory_row(tx: &rusqlite::Transaction<'_>, row: &Inventory) -> Result<bool> {
    let id = row.id.to_string();
    let time = row.time.map(time_to_text).transpose().map_err(anyhow::Error::from)?;
    let inserted = tx
        .execute(
            "INSERT OR IGNORE INTO inventory(
                id, observer_id, date, time, duration_minutes, locality_id,
                custom_altitude, custom_longitude, custom_latitude, custom_system,
                temperature, owner_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id,
                row.observer_id.to_string(),
                date_to_text(row.date).map_err(anyhow::Error::from)?,
                time,
                row.duration_minutes,
                row.locality_id.to_string(),
                row.custom_coordinates.map(|c| c.altitude),
                row.custom_coordinates.map(|c| c.longitude),
                row.custom_coordinates.map(|c| c.latitude),
                row.custom_coordinates.map(|c| c.system.as_str()),
                row.temperature,
                row.owner_id.map(|owner| owner.to_string()),
            ],
        )
        .with_context(|| format!("failed to import inventory row {id}"))?;

    if inserted == 0 {
        return Ok(false);
    }

    let associates: BTreeSet<String> = row.associate_ids.iter().map(ToString::to_string).collect();
    for observer in &associates {
        tx.execute(
            "INSERT INTO inventory_associate(inventory_id, observer_id) VALUES (?1, ?2)",
            params![id, observer],
        )
        .with_context(|| format!("failed to import inventory associate for {id}"))?;
    }
    let weathers: BTreeSet<String> = row.weather_ids.iter().map(ToString::to_string).collect();
    for weather in &weathers {
        tx.execute(
            "INSERT INTO inventory_weather(inventory_id, weather_id) VALUES (?1, ?2)",
            params![id, weather],
        )
        .with_context(|| format!("failed to import inventory weather for {id}"))?;
    }
    Ok(true)
}

fn import_entry_row(tx: &rusqlite::Transaction<'_>, row: &Entry) -> Result<bool> {
    let id = row.id.to_string();
    let inserted = tx
        .execute(
            "INSERT OR IGNORE INTO entry(
                id, inventory_id, species_id, sex_id, age_id, number_estimate_id,
                number, distance_estimate_id, distance, comment, owner_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                row.inventory_id.to_string(),
                row.species_id.to_string(),
                row.sex_id.to_string(),
                row.age_id.to_string(),
                row.number_estimate_id.to_string(),
                row.number,
                row.distance_estimate_id.map(|d| d.to_string()),
                row.distance,
                row.comment,
                row.owner_id.map(|owner| owner.to_string()),
            ],
        )
        .with_context(|| format!("failed to import entry row {id}"))?;

    if inserted == 0 {
        return Ok(false);
    }

    let behaviors: BTreeSet<String> = row.behavior_ids.iter().map(ToString::to_string).collect();
    for behavior in &behaviors {
        tx.execute(
            "INSERT INTO entry_behavior(entry_id, behavior_id) VALUES (?1, ?2)",
            params![id, behavior],
        )
        .with_context(|| format!("failed to import entry behavior for {id}"))?;
    }
    let environments: BTreeSet<String> =
        row.environment_ids.iter().map(ToString::to_string).collect();
    for environment in &environments {
        tx.execute(
            "INSERT INTO entry_environment(entry_id, environment_id) VALUES (?1, ?2)",
            params![id, environment],
        )
        .with_context(|| format!("failed to import entry environment for {id}"))?;
    }
    Ok(true)
}

fn export_file<T: Serialize>(
    out_dir: &Path,
    name: &str,
    values: Vec<T>,
) -> Result<ExportFileDigest> {
    let path = out_dir.join(name);
    let (sha256, records) = write_ndjson_file(&path, &values)?;
    Ok(ExportFileDigest { path: name.to_string(), sha256, records })
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in SNAPSHOT_FILES {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn storage_err(err: rusqlite::Error) -> DomainError {
    DomainError::Storage(err.to_string())
}

fn parse_id<T>(raw: &str, parse: fn(&str) -> Option<T>) -> Result<T, DomainError> {
    parse(raw).ok_or_else(|| DomainError::Storage(format!("invalid ULID: {raw}")))
}

fn parse_owner(raw: Option<&str>) -> Result<Option<UserId>, DomainError> {
    raw.map(|value| parse_id(value, UserId::parse)).transpose()
}

fn date_to_text(value: Date) -> Result<String, DomainError> {
    value.format(DATE_FORMAT).map_err(|err| DomainError::Storage(err.to_string()))
}

fn date_from_text(raw: &str) -> Result<Date, DomainError> {
    Date::parse(raw, DATE_FORMAT)
        .map_err(|err| DomainError::Storage(format!("invalid date {raw}: {err}")))
}

fn time_to_text(value: Time) -> Result<String, DomainError> {
    value.format(TIME_FORMAT).map_err(|err| DomainError::Storage(err.to_string()))
}

fn time_from_text(raw: &str) -> Result<Time, DomainError> {
    Time::parse(raw, TIME_FORMAT)
        .map_err(|err| DomainError::Storage(format!("invalid time {raw}: {err}")))
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
