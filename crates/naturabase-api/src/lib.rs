//! High-level operations facade over the core engines and the SQLite store.
//!
//! Every call opens the database at the configured path, migrates it to the
//! latest schema, and runs one operation. Callers that need a long-lived
//! handle should use `naturabase-store-sqlite` directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use naturabase_core::{
    fold_text, Age, AgeId, Behavior, BehaviorId, Department, DepartmentId,
    DistanceEstimate, DistanceEstimateId, DomainError, Entry, EntryCandidate, EntryDeletion,
    EntryId, EntrySearchCriteria, EntityKind, Environment, EnvironmentId, Inventory,
    InventoryCandidate, InventoryId, InventoryUpdate, Locality, LocalityId, NumberEstimate,
    NumberEstimateId, Observer, ObserverId, Principal, ReferenceEntity, ReferenceStore, Sex,
    SexId, Species, SpeciesId, SpeciesClass, Town, TownId, Weather, WeatherId,
};
use naturabase_store_sqlite::{
    ExportManifest, ImportSummary, IntegrityReport, ReferenceHit, SchemaStatus, SqliteStore,
};
use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::{Date, Time};

const DATE_FORMAT: &[BorrowedFormatItem<'_>] =
    time::macros::format_description!("[year]-[month]-[day]");
const TIME_FORMAT: &[BorrowedFormatItem<'_>] = time::macros::format_description!("[hour]:[minute]");

/// Entry point for callers that address the backend by database path.
#[derive(Debug, Clone)]
pub struct NaturabaseApi {
    db_path: PathBuf,
}

/// One flat legacy row: an inventory header and a single observation,
/// addressed by reference natural keys rather than ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabularRow {
    pub observer: String,
    #[serde(default)]
    pub associates: Vec<String>,
    pub date: String,
    pub time: Option<String>,
    pub duration_minutes: Option<u16>,
    pub department: String,
    pub town: String,
    pub locality: String,
    pub temperature: Option<i16>,
    #[serde(default)]
    pub weathers: Vec<String>,
    pub species: String,
    pub sex: String,
    pub age: String,
    pub number_estimate: String,
    pub number: Option<u32>,
    pub distance_estimate: Option<String>,
    pub distance: Option<u32>,
    pub comment: Option<String>,
    #[serde(default)]
    pub behaviors: Vec<String>,
    #[serde(default)]
    pub environments: Vec<String>,
}

/// Outcome of a tabular import batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabularImportReport {
    pub created_inventories: usize,
    pub reused_inventories: usize,
    pub created_entries: usize,
    pub skipped_duplicate_entries: usize,
}

/// Natural-key indexes over every reference table, built once per batch so
/// row resolution never goes back to the database.
pub struct ImportContext {
    observers: HashMap<String, ObserverId>,
    departments: HashMap<String, DepartmentId>,
    towns: HashMap<String, TownId>,
    localities: HashMap<String, LocalityId>,
    species: HashMap<String, SpeciesId>,
    sexes: HashMap<String, SexId>,
    ages: HashMap<String, AgeId>,
    number_estimates: HashMap<String, NumberEstimateId>,
    distance_estimates: HashMap<String, DistanceEstimateId>,
    behaviors: HashMap<String, BehaviorId>,
    environments: HashMap<String, EnvironmentId>,
    weathers: HashMap<String, WeatherId>,
}

impl ImportContext {
    /// Index every reference table by folded natural key.
    ///
    /// # Errors
    /// Propagates storage failures from the listing queries.
    pub fn load(store: &SqliteStore) -> Result<Self, DomainError> {
        Ok(Self {
            observers: key_index::<Observer>(store)?,
            departments: key_index::<Department>(store)?,
            towns: key_index::<Town>(store)?,
            localities: key_index::<Locality>(store)?,
            species: key_index::<Species>(store)?,
            sexes: key_index::<Sex>(store)?,
            ages: key_index::<Age>(store)?,
            number_estimates: key_index::<NumberEstimate>(store)?,
            distance_estimates: key_index::<DistanceEstimate>(store)?,
            behaviors: key_index::<Behavior>(store)?,
            environments: key_index::<Environment>(store)?,
            weathers: key_index::<Weather>(store)?,
        })
    }

    fn resolve<T: Copy>(
        index: &HashMap<String, T>,
        raw: &str,
        noun: &'static str,
    ) -> Result<T, DomainError> {
        index
            .get(&fold_text(raw.trim()))
            .copied()
            .ok_or_else(|| DomainError::NotFound { entity: noun, id: raw.trim().to_string() })
    }

    fn inventory_candidate(&self, row: &TabularRow) -> Result<InventoryCandidate, DomainError> {
        let department = Self::resolve(&self.departments, &row.department, "department")?;
        let town =
            Self::resolve(&self.towns, &format!("{department}|{}", row.town.trim()), "town")?;
        let locality = Self::resolve(
            &self.localities,
            &format!("{town}|{}", row.locality.trim()),
            "locality",
        )?;

        let mut associate_ids = Vec::with_capacity(row.associates.len());
        for associate in &row.associates {
            associate_ids.push(Self::resolve(&self.observers, associate, "observer")?);
        }
        let mut weather_ids = Vec::with_capacity(row.weathers.len());
        for weather in &row.weathers {
            weather_ids.push(Self::resolve(&self.weathers, weather, "weather")?);
        }

        Ok(InventoryCandidate {
            observer_id: Self::resolve(&self.observers, &row.observer, "observer")?,
            associate_ids,
            date: parse_date(&row.date)?,
            time: row.time.as_deref().map(parse_time).transpose()?,
            duration_minutes: row.duration_minutes,
            locality_id: locality,
            custom_coordinates: None,
            temperature: row.temperature,
            weather_ids,
        })
    }

    fn entry_candidate(
        &self,
        row: &TabularRow,
        inventory_id: InventoryId,
    ) -> Result<EntryCandidate, DomainError> {
        let mut behavior_ids = Vec::with_capacity(row.behaviors.len());
        for behavior in &row.behaviors {
            behavior_ids.push(Self::resolve(&self.behaviors, behavior, "behavior")?);
        }
        let mut environment_ids = Vec::with_capacity(row.environments.len());
        for environment in &row.environments {
            environment_ids.push(Self::resolve(&self.environments, environment, "environment")?);
        }

        Ok(EntryCandidate {
            inventory_id,
            species_id: Self::resolve(&self.species, &row.species, "species")?,
            sex_id: Self::resolve(&self.sexes, &row.sex, "sex")?,
            age_id: Self::resolve(&self.ages, &row.age, "age")?,
            number_estimate_id: Self::resolve(
                &self.number_estimates,
                &row.number_estimate,
                "number estimate",
            )?,
            number: row.number,
            distance_estimate_id: row
                .distance_estimate
                .as_deref()
                .map(|raw| Self::resolve(&self.distance_estimates, raw, "distance estimate"))
                .transpose()?,
            distance: row.distance,
            comment: row.comment.clone(),
            behavior_ids,
            environment_ids,
        })
    }
}

fn key_index<T>(store: &SqliteStore) -> Result<HashMap<String, <T as IdAddressed>::Id>, DomainError>
where
    T: ReferenceEntity + IdAddressed,
    SqliteStore: ReferenceStore<T>,
{
    let mut index = HashMap::new();
    for entity in store.list_references()? {
        index.insert(fold_text(&entity.natural_key()), entity.typed_id());
    }
    Ok(index)
}

/// Reference entities that expose their typed id, for natural-key indexing.
pub trait IdAddressed {
    type Id: Copy;
    fn typed_id(&self) -> Self::Id;
}

macro_rules! id_addressed {
    ($($entity:ident => $id:ident),+ $(,)?) => {
        $(
            impl IdAddressed for $entity {
                type Id = $id;
                fn typed_id(&self) -> Self::Id {
                    self.id
                }
            }
        )+
    };
}

id_addressed!(
    Observer => ObserverId,
    Department => DepartmentId,
    Town => TownId,
    Locality => LocalityId,
    Species => SpeciesId,
    Sex => SexId,
    Age => AgeId,
    NumberEstimate => NumberEstimateId,
    DistanceEstimate => DistanceEstimateId,
    Behavior => BehaviorId,
    Environment => EnvironmentId,
    Weather => WeatherId,
);

/// Expand to a `match` over the reference entity kinds, binding `$ty` to the
/// concrete entity type in each arm.
macro_rules! with_reference_kind {
    ($kind:expr, $ty:ident, $body:block) => {
        match $kind {
            EntityKind::Observer => {
                type $ty = Observer;
                $body
            }
            EntityKind::Department => {
                type $ty = Department;
                $body
            }
            EntityKind::Town => {
                type $ty = Town;
                $body
            }
            EntityKind::Locality => {
                type $ty = Locality;
                $body
            }
            EntityKind::SpeciesClass => {
                type $ty = SpeciesClass;
                $body
            }
            EntityKind::Species => {
                type $ty = Species;
                $body
            }
            EntityKind::Sex => {
                type $ty = Sex;
                $body
            }
            EntityKind::Age => {
                type $ty = Age;
                $body
            }
            EntityKind::NumberEstimate => {
                type $ty = NumberEstimate;
                $body
            }
            EntityKind::DistanceEstimate => {
                type $ty = DistanceEstimate;
                $body
            }
            EntityKind::Behavior => {
                type $ty = Behavior;
                $body
            }
            EntityKind::Environment => {
                type $ty = Environment;
                $body
            }
            EntityKind::Weather => {
                type $ty = Weather;
                $body
            }
            EntityKind::Inventory | EntityKind::Entry => Err(anyhow!(
                "{} is not a reference entity",
                $kind.as_str()
            )),
        }
    };
}

impl NaturabaseApi {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into() }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore, DomainError> {
        let mut store = SqliteStore::open(&self.db_path)
            .map_err(|err| DomainError::Storage(err.to_string()))?;
        store.migrate().map_err(|err| DomainError::Storage(err.to_string()))?;
        Ok(store)
    }

    fn open_store_anyhow(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// # Errors
    /// Propagates [`DomainError`] from the reference create engine.
    pub fn create_reference<T>(
        &self,
        principal: Option<&Principal>,
        draft: &T::Draft,
    ) -> Result<T, DomainError>
    where
        T: ReferenceEntity,
        SqliteStore: ReferenceStore<T>,
    {
        let mut store = self.open_store()?;
        naturabase_core::create_reference(&mut store, principal, draft)
    }

    /// # Errors
    /// Propagates [`DomainError`] from the reference update engine.
    pub fn update_reference<T>(
        &self,
        principal: Option<&Principal>,
        id: &str,
        draft: &T::Draft,
    ) -> Result<T, DomainError>
    where
        T: ReferenceEntity,
        SqliteStore: ReferenceStore<T>,
    {
        let mut store = self.open_store()?;
        naturabase_core::update_reference(&mut store, principal, id, draft)
    }

    /// # Errors
    /// Propagates [`DomainError`] from the reference delete engine.
    pub fn delete_reference<T>(
        &self,
        principal: Option<&Principal>,
        id: &str,
    ) -> Result<Option<T>, DomainError>
    where
        T: ReferenceEntity,
        SqliteStore: ReferenceStore<T>,
    {
        let mut store = self.open_store()?;
        naturabase_core::delete_reference(&mut store, principal, id)
    }

    /// # Errors
    /// Propagates [`DomainError::Storage`] from the listing query.
    pub fn list_references<T>(&self) -> Result<Vec<T>, DomainError>
    where
        T: ReferenceEntity,
        SqliteStore: ReferenceStore<T>,
    {
        let store = self.open_store()?;
        naturabase_core::list_references(&store)
    }

    /// Kind-dispatched reference create for callers that carry entity kinds
    /// and JSON payloads instead of concrete types.
    ///
    /// # Errors
    /// Fails on non-reference kinds, undecodable drafts, and engine errors.
    pub fn create_reference_value(
        &self,
        principal: Option<&Principal>,
        kind: EntityKind,
        draft: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        with_reference_kind!(kind, Ty, {
            let draft: <Ty as ReferenceEntity>::Draft = serde_json::from_value(draft.clone())
                .with_context(|| format!("invalid {} draft payload", kind.as_str()))?;
            let created: Ty = self.create_reference(principal, &draft)?;
            serde_json::to_value(created).context("failed to serialize created reference")
        })
    }

    /// Kind-dispatched reference update, JSON in and out.
    ///
    /// # Errors
    /// Fails on non-reference kinds, undecodable drafts, and engine errors.
    pub fn update_reference_value(
        &self,
        principal: Option<&Principal>,
        kind: EntityKind,
        id: &str,
        draft: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        with_reference_kind!(kind, Ty, {
            let draft: <Ty as ReferenceEntity>::Draft = serde_json::from_value(draft.clone())
                .with_context(|| format!("invalid {} draft payload", kind.as_str()))?;
            let updated: Ty = self.update_reference(principal, id, &draft)?;
            serde_json::to_value(updated).context("failed to serialize updated reference")
        })
    }

    /// Kind-dispatched reference delete; `Ok(None)` when the id was absent.
    ///
    /// # Errors
    /// Fails on non-reference kinds and engine errors.
    pub fn delete_reference_value(
        &self,
        principal: Option<&Principal>,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<serde_json::Value>> {
        with_reference_kind!(kind, Ty, {
            let deleted: Option<Ty> = self.delete_reference(principal, id)?;
            deleted
                .map(|entity| {
                    serde_json::to_value(entity).context("failed to serialize deleted reference")
                })
                .transpose()
        })
    }

    /// Kind-dispatched reference listing as a JSON array.
    ///
    /// # Errors
    /// Fails on non-reference kinds and storage errors.
    pub fn list_references_value(&self, kind: EntityKind) -> Result<serde_json::Value> {
        with_reference_kind!(kind, Ty, {
            let listed: Vec<Ty> = self.list_references()?;
            serde_json::to_value(listed).context("failed to serialize reference listing")
        })
    }

    /// # Errors
    /// Propagates [`DomainError`] from the ranked label search.
    pub fn search_reference_labels(
        &self,
        kind: EntityKind,
        q: &str,
        limit: u32,
    ) -> Result<Vec<ReferenceHit>, DomainError> {
        self.open_store()?.search_reference_labels(kind, q, limit)
    }

    /// # Errors
    /// Propagates [`DomainError`] from the idempotent inventory create.
    pub fn create_inventory(
        &self,
        principal: Option<&Principal>,
        candidate: &InventoryCandidate,
    ) -> Result<Inventory, DomainError> {
        let mut store = self.open_store()?;
        naturabase_core::create_inventory(&mut store, principal, candidate)
    }

    /// # Errors
    /// Propagates [`DomainError`] from the inventory update engine, including
    /// [`DomainError::SimilarInventoryAlreadyExists`] when migration is off.
    pub fn update_inventory(
        &self,
        principal: Option<&Principal>,
        id: InventoryId,
        candidate: &InventoryCandidate,
        migrate_entries: bool,
    ) -> Result<InventoryUpdate, DomainError> {
        let mut store = self.open_store()?;
        naturabase_core::update_inventory(&mut store, principal, id, candidate, migrate_entries)
    }

    /// # Errors
    /// Propagates [`DomainError`] from the guarded inventory delete.
    pub fn delete_inventory(
        &self,
        principal: Option<&Principal>,
        id: InventoryId,
    ) -> Result<Option<Inventory>, DomainError> {
        let mut store = self.open_store()?;
        naturabase_core::delete_inventory(&mut store, principal, id)
    }

    /// # Errors
    /// Propagates [`DomainError::Storage`] from the lookup.
    pub fn find_inventory(&self, id: InventoryId) -> Result<Option<Inventory>, DomainError> {
        use naturabase_core::InventoryRepository as _;
        self.open_store()?.inventory_by_id(id)
    }

    /// # Errors
    /// Propagates [`DomainError::Storage`] from the listing query.
    pub fn find_paginated_inventories(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Inventory>, DomainError> {
        self.open_store()?.list_inventories(Some(limit), offset)
    }

    /// # Errors
    /// Propagates [`DomainError::Storage`] from the count query.
    pub fn get_inventories_count(&self) -> Result<u64, DomainError> {
        self.open_store()?.count_inventories()
    }

    /// # Errors
    /// Propagates [`DomainError`] from the duplicate-rejecting entry create.
    pub fn create_entry(
        &self,
        principal: Option<&Principal>,
        candidate: &EntryCandidate,
    ) -> Result<Entry, DomainError> {
        let mut store = self.open_store()?;
        naturabase_core::create_entry(&mut store, principal, candidate)
    }

    /// # Errors
    /// The first failing row's [`DomainError`]; earlier rows persist.
    pub fn create_entries(
        &self,
        principal: Option<&Principal>,
        candidates: &[EntryCandidate],
    ) -> Result<Vec<Entry>, DomainError> {
        let mut store = self.open_store()?;
        naturabase_core::create_entries(&mut store, principal, candidates)
    }

    /// # Errors
    /// Propagates [`DomainError`] from the entry update engine.
    pub fn update_entry(
        &self,
        principal: Option<&Principal>,
        id: EntryId,
        candidate: &EntryCandidate,
    ) -> Result<Entry, DomainError> {
        let mut store = self.open_store()?;
        naturabase_core::update_entry(&mut store, principal, id, candidate)
    }

    /// # Errors
    /// Propagates [`DomainError`] from the cascading entry delete.
    pub fn delete_entry(
        &self,
        principal: Option<&Principal>,
        id: EntryId,
    ) -> Result<Option<EntryDeletion>, DomainError> {
        let mut store = self.open_store()?;
        naturabase_core::delete_entry(&mut store, principal, id)
    }

    /// # Errors
    /// Propagates [`DomainError::Storage`] from the lookup.
    pub fn find_entry(&self, id: EntryId) -> Result<Option<Entry>, DomainError> {
        use naturabase_core::EntryRepository as _;
        self.open_store()?.entry_by_id(id)
    }

    /// # Errors
    /// Propagates [`DomainError::Storage`] from the search query.
    pub fn find_paginated_entries(
        &self,
        criteria: &EntrySearchCriteria,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Entry>, DomainError> {
        self.open_store()?.search_entries(criteria, limit, offset)
    }

    /// # Errors
    /// Propagates [`DomainError::Storage`] from the count query.
    pub fn get_entries_count(&self, criteria: &EntrySearchCriteria) -> Result<u64, DomainError> {
        self.open_store()?.count_entries(criteria)
    }

    /// Import flat legacy rows. Inventory headers resolve idempotently, so
    /// rows sharing a header land under one inventory; exact duplicate
    /// observations are counted and skipped instead of aborting the batch.
    ///
    /// # Errors
    /// Unresolvable natural keys, unparsable dates or times, and any engine
    /// error other than a duplicate entry abort the batch with row context.
    pub fn import_tabular_rows(
        &self,
        principal: Option<&Principal>,
        rows: &[TabularRow],
    ) -> Result<TabularImportReport> {
        let mut store = self.open_store_anyhow()?;
        let context = ImportContext::load(&store)?;
        let mut report = TabularImportReport::default();
        let mut seen_inventories: Vec<InventoryId> = Vec::new();

        for (index, row) in rows.iter().enumerate() {
            let row_number = index + 1;
            let candidate = context
                .inventory_candidate(row)
                .with_context(|| format!("row {row_number}: cannot resolve inventory header"))?;
            let inventory = naturabase_core::create_inventory(&mut store, principal, &candidate)
                .with_context(|| format!("row {row_number}: inventory create failed"))?;
            if seen_inventories.contains(&inventory.id) {
                report.reused_inventories += 1;
            } else {
                seen_inventories.push(inventory.id);
                report.created_inventories += 1;
            }

            let entry = context
                .entry_candidate(row, inventory.id)
                .with_context(|| format!("row {row_number}: cannot resolve observation"))?;
            match naturabase_core::create_entry(&mut store, principal, &entry) {
                Ok(_) => report.created_entries += 1,
                Err(DomainError::AlreadyExists) => report.skipped_duplicate_entries += 1,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("row {row_number}: entry create failed"));
                }
            }
        }

        Ok(report)
    }

    /// # Errors
    /// Propagates schema metadata failures.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        SqliteStore::open(&self.db_path)?.schema_status()
    }

    /// # Errors
    /// Propagates migration failures.
    pub fn migrate(&self) -> Result<SchemaStatus> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        store.schema_status()
    }

    /// # Errors
    /// Propagates export failures.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        self.open_store_anyhow()?.export_snapshot(out_dir)
    }

    /// # Errors
    /// Propagates manifest validation and import failures.
    pub fn import_snapshot(&self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.open_store_anyhow()?.import_snapshot(in_dir, skip_existing)
    }

    /// # Errors
    /// Propagates backup failures.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        self.open_store_anyhow()?.backup_database(out_file)
    }

    /// # Errors
    /// Propagates restore and post-restore migration failures.
    pub fn restore_database(&self, in_file: &Path) -> Result<()> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.restore_database(in_file)
    }

    /// # Errors
    /// Propagates integrity probe failures.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store_anyhow()?.integrity_check()
    }
}

fn parse_date(raw: &str) -> Result<Date, DomainError> {
    Date::parse(raw.trim(), DATE_FORMAT)
        .map_err(|err| DomainError::Storage(format!("invalid date {raw}: {err}")))
}

fn parse_time(raw: &str) -> Result<Time, DomainError> {
    Time::parse(raw.trim(), TIME_FORMAT)
        .map_err(|err| DomainError::Storage(format!("invalid time {raw}: {err}")))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    use naturabase_core::{
        Coordinates, CoordinatesSystem, DepartmentDraft, LocalityDraft, ObserverDraft, Role,
        SexDraft, SpeciesClassDraft, SpeciesDraft, TownDraft, UserId,
        AgeDraft, NumberEstimateDraft,
    };
    use serde_json::json;

    use super::*;

    struct TempDb {
        dir: PathBuf,
        api: NaturabaseApi,
    }

    impl TempDb {
        fn new(tag: &str) -> Result<Self> {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |elapsed| elapsed.as_nanos());
            let dir = std::env::temp_dir()
                .join(format!("naturabase-api-{tag}-{}-{nanos}", std::process::id()));
            fs::create_dir_all(&dir)?;
            let api = NaturabaseApi::new(dir.join("naturabase.db"));
            Ok(Self { dir, api })
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn admin() -> Principal {
        Principal::new(UserId::new(), Role::Admin)
    }

    fn seed_minimal(api: &NaturabaseApi, principal: &Principal) -> Result<InventoryCandidate> {
        let observer: Observer =
            api.create_reference(Some(principal), &ObserverDraft { label: "Anne Roux".into() })?;
        let department: Department =
            api.create_reference(Some(principal), &DepartmentDraft { code: "38".into() })?;
        let town: Town = api.create_reference(
            Some(principal),
            &TownDraft { department_id: department.id, code: 38_185, name: "Grenoble".into() },
        )?;
        let locality: Locality = api.create_reference(
            Some(principal),
            &LocalityDraft {
                town_id: town.id,
                name: "Bastille".into(),
                coordinates: Coordinates {
                    altitude: 476,
                    longitude: 5.72,
                    latitude: 45.19,
                    system: CoordinatesSystem::Gps,
                },
            },
        )?;

        Ok(InventoryCandidate {
            observer_id: observer.id,
            associate_ids: vec![],
            date: Date::parse("2024-04-02", DATE_FORMAT)
                .map_err(|err| anyhow!("bad fixture date: {err}"))?,
            time: None,
            duration_minutes: None,
            locality_id: locality.id,
            custom_coordinates: None,
            temperature: None,
            weather_ids: vec![],
        })
    }

    #[test]
    fn inventory_create_is_idempotent_across_api_calls() -> Result<()> {
        let db = TempDb::new("idempotent")?;
        let principal = admin();
        let candidate = seed_minimal(&db.api, &principal)?;

        let first = db.api.create_inventory(Some(&principal), &candidate)?;
        let second = db.api.create_inventory(Some(&principal), &candidate)?;
        assert_eq!(first.id, second.id);
        assert_eq!(db.api.get_inventories_count()?, 1);
        Ok(())
    }

    #[test]
    fn kind_dispatched_reference_crud_roundtrips_json() -> Result<()> {
        let db = TempDb::new("dispatch")?;
        let principal = admin();

        let created = db.api.create_reference_value(
            Some(&principal),
            EntityKind::Sex,
            &json!({"label": "femelle"}),
        )?;
        let id = created
            .get("id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| anyhow!("created reference has no id"))?
            .to_string();

        let listed = db.api.list_references_value(EntityKind::Sex)?;
        let rows = listed.as_array().ok_or_else(|| anyhow!("listing is not an array"))?;
        assert_eq!(rows.len(), 1);

        let deleted = db.api.delete_reference_value(Some(&principal), EntityKind::Sex, &id)?;
        assert!(deleted.is_some());
        assert!(db.api.delete_reference_value(Some(&principal), EntityKind::Sex, &id)?.is_none());
        Ok(())
    }

    #[test]
    fn dispatch_rejects_non_reference_kinds() -> Result<()> {
        let db = TempDb::new("nonref")?;
        let result = db.api.list_references_value(EntityKind::Entry);
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn tabular_import_groups_rows_under_one_inventory() -> Result<()> {
        let db = TempDb::new("tabular")?;
        let principal = admin();
        seed_minimal(&db.api, &principal)?;
        let _: SpeciesClass = db
            .api
            .create_reference(Some(&principal), &SpeciesClassDraft { label: "Oiseaux".into() })?;
        let class: Vec<SpeciesClass> = db.api.list_references()?;
        let class_id = class
            .first()
            .map(|c| c.id)
            .ok_or_else(|| anyhow!("species class fixture missing"))?;
        let _: Species = db.api.create_reference(
            Some(&principal),
            &SpeciesDraft {
                species_class_id: class_id,
                code: "ROUGOR".into(),
                name: "Rougegorge familier".into(),
                latin_name: "Erithacus rubecula".into(),
            },
        )?;
        let _: Species = db.api.create_reference(
            Some(&principal),
            &SpeciesDraft {
                species_class_id: class_id,
                code: "TROMIG".into(),
                name: "Troglodyte mignon".into(),
                latin_name: "Troglodytes troglodytes".into(),
            },
        )?;
        let _: Sex =
            db.api.create_reference(Some(&principal), &SexDraft { label: "indéterminé".into() })?;
        let _: Age =
            db.api.create_reference(Some(&principal), &AgeDraft { label: "adulte".into() })?;
        let _: NumberEstimate = db
            .api
            .create_reference(Some(&principal), &NumberEstimateDraft { label: "estimé".into() })?;

        let base = TabularRow {
            observer: "Anne Roux".into(),
            date: "2024-04-02".into(),
            department: "38".into(),
            town: "Grenoble".into(),
            locality: "Bastille".into(),
            species: "ROUGOR".into(),
            sex: "indéterminé".into(),
            age: "adulte".into(),
            number_estimate: "estimé".into(),
            number: Some(1),
            ..Default::default()
        };
        let second = TabularRow { species: "TROMIG".into(), ..base.clone() };
        let duplicate = base.clone();

        let report =
            db.api.import_tabular_rows(Some(&principal), &[base, second, duplicate])?;
        assert_eq!(report.created_inventories, 1);
        assert_eq!(report.reused_inventories, 2);
        assert_eq!(report.created_entries, 2);
        assert_eq!(report.skipped_duplicate_entries, 1);
        assert_eq!(db.api.get_entries_count(&EntrySearchCriteria::default())?, 2);
        Ok(())
    }

    #[test]
    fn tabular_import_names_the_failing_row() -> Result<()> {
        let db = TempDb::new("rowerr")?;
        let principal = admin();
        seed_minimal(&db.api, &principal)?;

        let row = TabularRow {
            observer: "Personne Inconnue".into(),
            date: "2024-04-02".into(),
            department: "38".into(),
            town: "Grenoble".into(),
            locality: "Bastille".into(),
            species: "ROUGOR".into(),
            sex: "indéterminé".into(),
            age: "adulte".into(),
            number_estimate: "estimé".into(),
            ..Default::default()
        };
        let err = match db.api.import_tabular_rows(Some(&principal), &[row]) {
            Ok(_) => return Err(anyhow!("import should have failed")),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("row 1"));
        Ok(())
    }
}
