use super::queries::date_to_sql;
use super::Store;
use crate::domain::model::{Category, Money, OrderStatus, DEFAULT_SLOT_CAPACITY};
use crate::utils::error::{Result, StallbookError};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Transaction};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// One record of a fixture file: `{"model": "...", "pk": 1, "fields": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureRecord {
    pub model: String,
    pub pk: i64,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FixtureModel {
    Account,
    StudentProfile,
    Stall,
    TimeSlot,
    FoodItem,
    Order,
    OrderItem,
    DemandRecord,
}

impl FixtureModel {
    /// Accepts short names (`food_item`) and app-label names (`orders.fooditem`).
    pub fn from_label(label: &str) -> Result<Self> {
        let lowered = label.to_ascii_lowercase();
        let bare = lowered
            .rsplit_once('.')
            .map(|(_, name)| name)
            .unwrap_or(lowered.as_str())
            .replace('_', "");

        let model = match bare.as_str() {
            "user" | "account" => FixtureModel::Account,
            "studentprofile" | "profile" => FixtureModel::StudentProfile,
            "foodstall" | "stall" => FixtureModel::Stall,
            "breaktimeslot" | "timeslot" | "slot" => FixtureModel::TimeSlot,
            "fooditem" | "item" => FixtureModel::FoodItem,
            "order" => FixtureModel::Order,
            "orderitem" => FixtureModel::OrderItem,
            "demandrecord" => FixtureModel::DemandRecord,
            _ => {
                return Err(StallbookError::validation(format!(
                    "unknown fixture model '{}'",
                    label
                )))
            }
        };
        Ok(model)
    }

    pub fn name(&self) -> &'static str {
        match self {
            FixtureModel::Account => "account",
            FixtureModel::StudentProfile => "student_profile",
            FixtureModel::Stall => "stall",
            FixtureModel::TimeSlot => "time_slot",
            FixtureModel::FoodItem => "food_item",
            FixtureModel::Order => "order",
            FixtureModel::OrderItem => "order_item",
            FixtureModel::DemandRecord => "demand_record",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixtureReport {
    pub total: usize,
    pub per_model: BTreeMap<&'static str, usize>,
}

/// 欄位存取輔助，錯誤訊息帶上 model 與 pk
struct Fields<'a> {
    record: &'a FixtureRecord,
}

impl<'a> Fields<'a> {
    fn error(&self, field: &str, reason: &str) -> StallbookError {
        StallbookError::validation(format!(
            "fixture record {} #{}: field '{}' {}",
            self.record.model, self.record.pk, field, reason
        ))
    }

    fn get(&self, field: &str) -> Option<&'a Value> {
        self.record.fields.get(field).filter(|v| !v.is_null())
    }

    fn string(&self, field: &str) -> Result<String> {
        match self.get(field) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(self.error(field, "must be a string")),
            None => Err(self.error(field, "is required")),
        }
    }

    fn string_or(&self, field: &str, default: &str) -> Result<String> {
        match self.get(field) {
            None => Ok(default.to_string()),
            Some(_) => self.string(field),
        }
    }

    fn integer(&self, field: &str) -> Result<i64> {
        match self.get(field) {
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| self.error(field, "must be an integer")),
            Some(_) => Err(self.error(field, "must be an integer")),
            None => Err(self.error(field, "is required")),
        }
    }

    fn integer_or(&self, field: &str, default: i64) -> Result<i64> {
        match self.get(field) {
            None => Ok(default),
            Some(_) => self.integer(field),
        }
    }

    fn optional_integer(&self, field: &str) -> Result<Option<i64>> {
        match self.get(field) {
            None => Ok(None),
            Some(_) => self.integer(field).map(Some),
        }
    }

    fn boolean_or(&self, field: &str, default: bool) -> Result<bool> {
        match self.get(field) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(self.error(field, "must be a boolean")),
        }
    }

    fn money(&self, field: &str) -> Result<Option<Money>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(s)) => s.parse().map(Some).map_err(|_| self.error(field, "is not an amount")),
            Some(Value::Number(n)) => n
                .to_string()
                .parse()
                .map(Some)
                .map_err(|_| self.error(field, "is not an amount")),
            Some(_) => Err(self.error(field, "is not an amount")),
        }
    }

    fn date(&self, field: &str) -> Result<NaiveDate> {
        let raw = self.string(field)?;
        NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| self.error(field, "is not a YYYY-MM-DD date"))
    }

    fn datetime_or_now(&self, field: &str) -> Result<DateTime<Utc>> {
        match self.get(field) {
            None => Ok(Utc::now()),
            Some(_) => {
                let raw = self.string(field)?;
                DateTime::parse_from_rfc3339(&raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .or_else(|_| {
                        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S")
                            .map(|naive| naive.and_utc())
                    })
                    .map_err(|_| self.error(field, "is not a timestamp"))
            }
        }
    }
}

impl Store {
    pub fn load_fixture<P: AsRef<Path>>(&mut self, path: P) -> Result<FixtureReport> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(StallbookError::not_found("Fixture file", path.display()));
        }
        let content = std::fs::read_to_string(path)?;
        self.load_fixture_str(&content)
    }

    /// 整份 fixture 在單一交易中載入；外鍵在 commit 時才檢查，因此記錄順序不拘
    pub fn load_fixture_str(&mut self, content: &str) -> Result<FixtureReport> {
        let records: Vec<FixtureRecord> = serde_json::from_str(content)?;

        let tx = self.connection_mut().transaction()?;
        tx.execute_batch("PRAGMA defer_foreign_keys = ON;")?;

        let mut report = FixtureReport::default();
        let mut orders_without_total = Vec::new();
        let mut items_without_price = Vec::new();

        for record in &records {
            let model = FixtureModel::from_label(&record.model)?;
            let fields = Fields { record };
            match model {
                FixtureModel::Account => upsert_account(&tx, record.pk, &fields)?,
                FixtureModel::StudentProfile => upsert_profile(&tx, &fields)?,
                FixtureModel::Stall => upsert_stall(&tx, record.pk, &fields)?,
                FixtureModel::TimeSlot => upsert_slot(&tx, record.pk, &fields)?,
                FixtureModel::FoodItem => upsert_item(&tx, record.pk, &fields)?,
                FixtureModel::Order => {
                    if !upsert_order(&tx, record.pk, &fields)? {
                        orders_without_total.push(record.pk);
                    }
                }
                FixtureModel::OrderItem => {
                    if !upsert_order_item(&tx, record.pk, &fields)? {
                        items_without_price.push(record);
                    }
                }
                FixtureModel::DemandRecord => upsert_demand(&tx, record.pk, &fields)?,
            }
            report.total += 1;
            *report.per_model.entry(model.name()).or_insert(0) += 1;
        }

        // price snapshot defaults to the item's current price
        for record in items_without_price {
            let updated = tx.execute(
                "UPDATE order_items SET price_at_order_paise = (
                     SELECT price_paise FROM food_items WHERE food_items.id = order_items.food_item_id)
                 WHERE id = ?1
                   AND EXISTS (SELECT 1 FROM food_items WHERE food_items.id = order_items.food_item_id)",
                [record.pk],
            )?;
            if updated == 0 {
                return Err(Fields { record }.error("price_at_order", "is missing and the food item is unknown"));
            }
        }

        for order_id in orders_without_total {
            tx.execute(
                "UPDATE orders SET total_paise = (
                     SELECT COALESCE(SUM(quantity * price_at_order_paise), 0)
                     FROM order_items WHERE order_id = ?1)
                 WHERE id = ?1",
                [order_id],
            )?;
        }

        tx.commit()?;
        tracing::info!("📦 Installed {} object(s) from fixture", report.total);
        Ok(report)
    }
}

fn upsert_account(tx: &Transaction<'_>, pk: i64, f: &Fields<'_>) -> Result<()> {
    let created_at = match f.get("date_joined") {
        Some(_) => f.datetime_or_now("date_joined")?,
        None => f.datetime_or_now("created_at")?,
    };
    tx.execute(
        "INSERT INTO accounts (id, username, first_name, last_name, email, is_staff, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (id) DO UPDATE SET
             username = excluded.username, first_name = excluded.first_name,
             last_name = excluded.last_name, email = excluded.email,
             is_staff = excluded.is_staff, created_at = excluded.created_at",
        params![
            pk,
            f.string("username")?,
            f.string_or("first_name", "")?,
            f.string_or("last_name", "")?,
            f.string_or("email", "")?,
            f.boolean_or("is_staff", false)?,
            created_at.to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Profiles attach to their account through the `user` field, not their own pk.
fn upsert_profile(tx: &Transaction<'_>, f: &Fields<'_>) -> Result<()> {
    let account_id = match f.get("user") {
        Some(_) => f.integer("user")?,
        None => f.integer("account")?,
    };
    tx.execute(
        "INSERT INTO student_profiles (account_id, registration_number, phone, department, semester)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (account_id) DO UPDATE SET
             registration_number = excluded.registration_number, phone = excluded.phone,
             department = excluded.department, semester = excluded.semester",
        params![
            account_id,
            f.string("registration_number")?,
            f.string_or("phone", "")?,
            f.string_or("department", "")?,
            f.integer_or("semester", 1)?
        ],
    )?;
    Ok(())
}

fn upsert_stall(tx: &Transaction<'_>, pk: i64, f: &Fields<'_>) -> Result<()> {
    tx.execute(
        "INSERT INTO stalls (id, name, location, description, is_open, owner_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (id) DO UPDATE SET
             name = excluded.name, location = excluded.location,
             description = excluded.description, is_open = excluded.is_open,
             owner_id = excluded.owner_id",
        params![
            pk,
            f.string("name")?,
            f.string("location")?,
            f.string_or("description", "")?,
            f.boolean_or("is_open", true)?,
            f.optional_integer("owner")?
        ],
    )?;
    Ok(())
}

fn upsert_slot(tx: &Transaction<'_>, pk: i64, f: &Fields<'_>) -> Result<()> {
    tx.execute(
        "INSERT INTO time_slots (id, slot_time, max_capacity) VALUES (?1, ?2, ?3)
         ON CONFLICT (id) DO UPDATE SET
             slot_time = excluded.slot_time, max_capacity = excluded.max_capacity",
        params![
            pk,
            f.string("slot_time")?,
            f.integer_or("max_capacity", DEFAULT_SLOT_CAPACITY)?
        ],
    )?;
    Ok(())
}

fn upsert_item(tx: &Transaction<'_>, pk: i64, f: &Fields<'_>) -> Result<()> {
    let price = f.money("price")?.ok_or_else(|| f.error("price", "is required"))?;
    let category: Category = f
        .string_or("category", Category::default().as_str())?
        .parse()
        .map_err(|_| f.error("category", "is not a known category"))?;
    tx.execute(
        "INSERT INTO food_items (id, stall_id, name, description, price_paise, category, is_available, preparation_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (id) DO UPDATE SET
             stall_id = excluded.stall_id, name = excluded.name,
             description = excluded.description, price_paise = excluded.price_paise,
             category = excluded.category, is_available = excluded.is_available,
             preparation_time = excluded.preparation_time",
        params![
            pk,
            f.integer("stall")?,
            f.string("name")?,
            f.string_or("description", "")?,
            price.paise(),
            category.as_str(),
            f.boolean_or("is_available", true)?,
            f.integer_or("preparation_time", 10)?
        ],
    )?;
    Ok(())
}

/// Returns false when the record carried no total and it must be derived.
fn upsert_order(tx: &Transaction<'_>, pk: i64, f: &Fields<'_>) -> Result<bool> {
    let status: OrderStatus = f
        .string_or("status", OrderStatus::default().as_str())?
        .parse()
        .map_err(|_| f.error("status", "is not a valid status"))?;
    let total = f.money("total_amount")?;
    let account_id = match f.get("student") {
        Some(_) => f.integer("student")?,
        None => f.integer("account")?,
    };
    tx.execute(
        "INSERT INTO orders (id, account_id, stall_id, time_slot_id, order_date, order_time, status, total_paise, special_instructions)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT (id) DO UPDATE SET
             account_id = excluded.account_id, stall_id = excluded.stall_id,
             time_slot_id = excluded.time_slot_id, order_date = excluded.order_date,
             order_time = excluded.order_time, status = excluded.status,
             total_paise = excluded.total_paise,
             special_instructions = excluded.special_instructions",
        params![
            pk,
            account_id,
            f.integer("stall")?,
            f.integer("time_slot")?,
            date_to_sql(f.date("order_date")?),
            f.datetime_or_now("order_time")?.to_rfc3339(),
            status.as_str(),
            total.unwrap_or_default().paise(),
            f.string_or("special_instructions", "")?
        ],
    )?;
    Ok(total.is_some())
}

/// Returns false when `price_at_order` is absent; the snapshot is filled in after every record is loaded.
fn upsert_order_item(tx: &Transaction<'_>, pk: i64, f: &Fields<'_>) -> Result<bool> {
    let price = f.money("price_at_order")?;
    tx.execute(
        "INSERT INTO order_items (id, order_id, food_item_id, quantity, price_at_order_paise)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (id) DO UPDATE SET
             order_id = excluded.order_id, food_item_id = excluded.food_item_id,
             quantity = excluded.quantity, price_at_order_paise = excluded.price_at_order_paise",
        params![
            pk,
            f.integer("order")?,
            f.integer("food_item")?,
            f.integer_or("quantity", 1)?,
            price.unwrap_or_default().paise()
        ],
    )?;
    Ok(price.is_some())
}

fn upsert_demand(tx: &Transaction<'_>, pk: i64, f: &Fields<'_>) -> Result<()> {
    let date = f.date("date")?;
    let day_of_week = f.integer_or("day_of_week", date.weekday().num_days_from_monday() as i64)?;
    tx.execute(
        "INSERT INTO demand_records (id, food_item_id, date, time_slot_id, day_of_week, quantity_ordered, predicted_demand)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (id) DO UPDATE SET
             food_item_id = excluded.food_item_id, date = excluded.date,
             time_slot_id = excluded.time_slot_id, day_of_week = excluded.day_of_week,
             quantity_ordered = excluded.quantity_ordered,
             predicted_demand = excluded.predicted_demand",
        params![
            pk,
            f.integer("food_item")?,
            date_to_sql(date),
            f.integer("time_slot")?,
            day_of_week,
            f.integer_or("quantity_ordered", 0)?,
            f.integer_or("predicted_demand", 0)?
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL_FIXTURE: &str = r#"[
        {"model": "orders.fooditem", "pk": 1, "fields": {"stall": 1, "name": "Masala Dosa", "price": "45.00", "category": "breakfast"}},
        {"model": "orders.foodstall", "pk": 1, "fields": {"name": "South Corner", "location": "Block 34"}},
        {"model": "orders.breaktimeslot", "pk": 1, "fields": {"slot_time": "12:00-12:30"}}
    ]"#;

    fn migrated() -> Store {
        let mut store = Store::open_in_memory().unwrap();
        store.migrate().unwrap();
        store
    }

    #[test]
    fn test_model_labels() {
        assert_eq!(FixtureModel::from_label("orders.FoodStall").unwrap(), FixtureModel::Stall);
        assert_eq!(FixtureModel::from_label("food_item").unwrap(), FixtureModel::FoodItem);
        assert_eq!(FixtureModel::from_label("auth.user").unwrap(), FixtureModel::Account);
        assert!(FixtureModel::from_label("orders.coupon").is_err());
    }

    #[test]
    fn test_forward_references_resolve_at_commit() {
        let mut store = migrated();
        let report = store.load_fixture_str(SMALL_FIXTURE).unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.per_model.get("food_item"), Some(&1));

        let item = store.get_food_item(1).unwrap();
        assert_eq!(item.price, Money(4500));
        assert_eq!(item.category, Category::Breakfast);
        assert_eq!(item.preparation_time, 10);
        assert_eq!(store.get_time_slot(1).unwrap().max_capacity, 50);
    }

    #[test]
    fn test_reload_is_upsert() {
        let mut store = migrated();
        store.load_fixture_str(SMALL_FIXTURE).unwrap();
        store.load_fixture_str(SMALL_FIXTURE).unwrap();
        assert_eq!(store.open_stalls().unwrap().len(), 1);
    }

    #[test]
    fn test_dangling_reference_rolls_back() {
        let mut store = migrated();
        let broken = r#"[
            {"model": "stall", "pk": 1, "fields": {"name": "A", "location": "B"}},
            {"model": "food_item", "pk": 1, "fields": {"stall": 99, "name": "Ghost", "price": 10}}
        ]"#;
        assert!(store.load_fixture_str(broken).is_err());
        assert!(store.open_stalls().unwrap().is_empty());
    }

    #[test]
    fn test_missing_required_field() {
        let mut store = migrated();
        let err = store
            .load_fixture_str(r#"[{"model": "stall", "pk": 1, "fields": {"name": "A"}}]"#)
            .unwrap_err();
        assert!(err.to_string().contains("location"));
    }

    #[test]
    fn test_order_total_derived_when_absent() {
        let mut store = migrated();
        let fixture = r#"[
            {"model": "auth.user", "pk": 7, "fields": {"username": "riya"}},
            {"model": "stall", "pk": 1, "fields": {"name": "A", "location": "B"}},
            {"model": "time_slot", "pk": 1, "fields": {"slot_time": "10:00-10:30"}},
            {"model": "food_item", "pk": 1, "fields": {"stall": 1, "name": "Tea", "price": "10.00"}},
            {"model": "order", "pk": 1, "fields": {"student": 7, "stall": 1, "time_slot": 1, "order_date": "2026-03-02"}},
            {"model": "order_item", "pk": 1, "fields": {"order": 1, "food_item": 1, "quantity": 3}}
        ]"#;
        store.load_fixture_str(fixture).unwrap();
        assert_eq!(store.get_order(1).unwrap().total_amount, Money(3000));
    }

    #[test]
    fn test_order_item_price_resolved_after_later_food_item() {
        let mut store = migrated();
        let fixture = r#"[
            {"model": "order_item", "pk": 1, "fields": {"order": 1, "food_item": 1, "quantity": 2}},
            {"model": "order", "pk": 1, "fields": {"student": 7, "stall": 1, "time_slot": 1, "order_date": "2026-03-02"}},
            {"model": "auth.user", "pk": 7, "fields": {"username": "riya"}},
            {"model": "stall", "pk": 1, "fields": {"name": "A", "location": "B"}},
            {"model": "time_slot", "pk": 1, "fields": {"slot_time": "10:00-10:30"}},
            {"model": "food_item", "pk": 1, "fields": {"stall": 1, "name": "Tea", "price": "12.50"}}
        ]"#;
        store.load_fixture_str(fixture).unwrap();

        let items = store.order_items(1).unwrap();
        assert_eq!(items[0].price_at_order, Money(1250));
        assert_eq!(store.get_order(1).unwrap().total_amount, Money(2500));
    }

    #[test]
    fn test_order_item_without_price_or_food_item_fails() {
        let mut store = migrated();
        let fixture = r#"[
            {"model": "order_item", "pk": 4, "fields": {"order": 1, "food_item": 9, "quantity": 1}}
        ]"#;
        let err = store.load_fixture_str(fixture).unwrap_err();
        assert!(err.to_string().contains("price_at_order"));
    }
}
