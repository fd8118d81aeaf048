use super::Store;
use crate::domain::model::{
    Account, Category, DemandRecord, FoodItem, Money, Order, OrderItem, OrderStatus, Stall,
    StudentProfile, TimeSlot,
};
use crate::utils::error::{Result, StallbookError};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MenuFilter {
    pub category: Option<Category>,
    pub stall_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAccount {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub is_staff: bool,
    pub profile: Option<StudentProfile>,
}

/// Everything needed to persist one order. Prices are already snapshotted.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderDraft {
    pub account_id: i64,
    pub stall_id: i64,
    pub time_slot_id: i64,
    pub order_date: NaiveDate,
    pub order_time: DateTime<Utc>,
    pub special_instructions: String,
    /// (food item id, quantity, unit price)
    pub lines: Vec<(i64, i64, Money)>,
}

pub(crate) fn date_to_sql(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

fn datetime_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parsed_col<T: FromStr<Err = StallbookError>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

const ACCOUNT_COLUMNS: &str = "a.id, a.username, a.first_name, a.last_name, a.email, a.is_staff, a.created_at,
     p.registration_number, p.phone, p.department, p.semester";

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let registration_number: Option<String> = row.get(7)?;
    let profile = match registration_number {
        Some(registration_number) => Some(StudentProfile {
            registration_number,
            phone: row.get(8)?,
            department: row.get(9)?,
            semester: row.get(10)?,
        }),
        None => None,
    };
    Ok(Account {
        id: row.get(0)?,
        username: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        email: row.get(4)?,
        is_staff: row.get(5)?,
        created_at: datetime_col(row, 6)?,
        profile,
    })
}

const STALL_COLUMNS: &str = "id, name, location, description, is_open, owner_id";

fn stall_from_row(row: &Row<'_>) -> rusqlite::Result<Stall> {
    Ok(Stall {
        id: row.get(0)?,
        name: row.get(1)?,
        location: row.get(2)?,
        description: row.get(3)?,
        is_open: row.get(4)?,
        owner_id: row.get(5)?,
    })
}

const ITEM_COLUMNS: &str =
    "id, stall_id, name, description, price_paise, category, is_available, preparation_time";

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<FoodItem> {
    Ok(FoodItem {
        id: row.get(0)?,
        stall_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        price: Money(row.get(4)?),
        category: parsed_col(row, 5)?,
        is_available: row.get(6)?,
        preparation_time: row.get(7)?,
    })
}

fn slot_from_row(row: &Row<'_>) -> rusqlite::Result<TimeSlot> {
    Ok(TimeSlot {
        id: row.get(0)?,
        slot_time: row.get(1)?,
        max_capacity: row.get(2)?,
    })
}

const ORDER_COLUMNS: &str = "id, account_id, stall_id, time_slot_id, order_date, order_time, status, total_paise, special_instructions";

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        id: row.get(0)?,
        account_id: row.get(1)?,
        stall_id: row.get(2)?,
        time_slot_id: row.get(3)?,
        order_date: date_col(row, 4)?,
        order_time: datetime_col(row, 5)?,
        status: parsed_col(row, 6)?,
        total_amount: Money(row.get(7)?),
        special_instructions: row.get(8)?,
    })
}

fn order_item_from_row(row: &Row<'_>) -> rusqlite::Result<OrderItem> {
    Ok(OrderItem {
        id: row.get(0)?,
        order_id: row.get(1)?,
        food_item_id: row.get(2)?,
        quantity: row.get(3)?,
        price_at_order: Money(row.get(4)?),
    })
}

fn demand_from_row(row: &Row<'_>) -> rusqlite::Result<DemandRecord> {
    Ok(DemandRecord {
        id: row.get(0)?,
        food_item_id: row.get(1)?,
        date: date_col(row, 2)?,
        time_slot_id: row.get(3)?,
        day_of_week: row.get(4)?,
        quantity_ordered: row.get(5)?,
        predicted_demand: row.get(6)?,
    })
}

fn status_placeholders(statuses: &[OrderStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Store {
    // ---- accounts ----

    pub fn insert_account(&mut self, account: &NewAccount) -> Result<i64> {
        let tx = self.connection_mut().transaction()?;
        tx.execute(
            "INSERT INTO accounts (username, first_name, last_name, email, is_staff, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                account.username,
                account.first_name,
                account.last_name,
                account.email,
                account.is_staff,
                Utc::now().to_rfc3339()
            ],
        )?;
        let id = tx.last_insert_rowid();
        if let Some(profile) = &account.profile {
            tx.execute(
                "INSERT INTO student_profiles (account_id, registration_number, phone, department, semester)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id,
                    profile.registration_number,
                    profile.phone,
                    profile.department,
                    profile.semester
                ],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    pub fn get_account(&self, id: i64) -> Result<Account> {
        let sql = format!(
            "SELECT {} FROM accounts a LEFT JOIN student_profiles p ON p.account_id = a.id WHERE a.id = ?1",
            ACCOUNT_COLUMNS
        );
        self.connection()
            .query_row(&sql, [id], account_from_row)
            .optional()?
            .ok_or_else(|| StallbookError::not_found("Account", id))
    }

    pub fn username_taken(&self, username: &str) -> Result<bool> {
        let count: i64 = self.connection().query_row(
            "SELECT COUNT(*) FROM accounts WHERE username = ?1",
            [username],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn registration_number_taken(&self, registration_number: &str) -> Result<bool> {
        let count: i64 = self.connection().query_row(
            "SELECT COUNT(*) FROM student_profiles WHERE registration_number = ?1",
            [registration_number],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ---- stalls & menu ----

    pub fn open_stalls(&self) -> Result<Vec<Stall>> {
        let sql = format!(
            "SELECT {} FROM stalls WHERE is_open = 1 ORDER BY id",
            STALL_COLUMNS
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let stalls = stmt
            .query_map([], stall_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stalls)
    }

    pub fn get_stall(&self, id: i64) -> Result<Stall> {
        let sql = format!("SELECT {} FROM stalls WHERE id = ?1", STALL_COLUMNS);
        self.connection()
            .query_row(&sql, [id], stall_from_row)
            .optional()?
            .ok_or_else(|| StallbookError::not_found("Stall", id))
    }

    pub fn available_items(&self, filter: &MenuFilter) -> Result<Vec<FoodItem>> {
        let sql = format!(
            "SELECT {} FROM food_items
             WHERE is_available = 1
               AND (?1 IS NULL OR category = ?1)
               AND (?2 IS NULL OR stall_id = ?2)
             ORDER BY id",
            ITEM_COLUMNS
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let items = stmt
            .query_map(
                params![filter.category.map(|c| c.as_str()), filter.stall_id],
                item_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    pub fn get_food_item(&self, id: i64) -> Result<FoodItem> {
        let sql = format!("SELECT {} FROM food_items WHERE id = ?1", ITEM_COLUMNS);
        self.connection()
            .query_row(&sql, [id], item_from_row)
            .optional()?
            .ok_or_else(|| StallbookError::not_found("Food item", id))
    }

    // ---- time slots ----

    pub fn time_slots(&self) -> Result<Vec<TimeSlot>> {
        let mut stmt = self
            .connection()
            .prepare("SELECT id, slot_time, max_capacity FROM time_slots ORDER BY id")?;
        let slots = stmt
            .query_map([], slot_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(slots)
    }

    pub fn get_time_slot(&self, id: i64) -> Result<TimeSlot> {
        self.connection()
            .query_row(
                "SELECT id, slot_time, max_capacity FROM time_slots WHERE id = ?1",
                [id],
                slot_from_row,
            )
            .optional()?
            .ok_or_else(|| StallbookError::not_found("Time slot", id))
    }

    /// Orders on `date` that still hold a place in the slot.
    pub fn occupying_orders(&self, slot_id: i64, date: NaiveDate) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM orders WHERE time_slot_id = ?1 AND order_date = ?2 AND status IN ({})",
            status_placeholders(&OrderStatus::OCCUPYING)
        );
        let count = self
            .connection()
            .query_row(&sql, params![slot_id, date_to_sql(date)], |row| row.get(0))?;
        Ok(count)
    }

    /// Every slot with its order count on `date`, whatever the status.
    pub fn slot_order_counts(&self, date: NaiveDate) -> Result<Vec<(TimeSlot, i64)>> {
        let mut stmt = self.connection().prepare(
            "SELECT s.id, s.slot_time, s.max_capacity, COUNT(o.id)
             FROM time_slots s
             LEFT JOIN orders o ON o.time_slot_id = s.id AND o.order_date = ?1
             GROUP BY s.id
             ORDER BY s.id",
        )?;
        let counts = stmt
            .query_map([date_to_sql(date)], |row| Ok((slot_from_row(row)?, row.get(3)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    // ---- orders ----

    /// 在同一個交易中檢查容量並寫入訂單與明細
    pub fn create_order(&mut self, draft: &OrderDraft) -> Result<Order> {
        let tx = self.connection_mut().transaction()?;

        let (slot_time, capacity): (String, i64) = tx
            .query_row(
                "SELECT slot_time, max_capacity FROM time_slots WHERE id = ?1",
                [draft.time_slot_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| StallbookError::not_found("Time slot", draft.time_slot_id))?;

        let occupied: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM orders WHERE time_slot_id = ?1 AND order_date = ?2 AND status IN ({})",
                status_placeholders(&OrderStatus::OCCUPYING)
            ),
            params![draft.time_slot_id, date_to_sql(draft.order_date)],
            |row| row.get(0),
        )?;
        if occupied >= capacity {
            let label = TimeSlot {
                id: draft.time_slot_id,
                slot_time,
                max_capacity: capacity,
            }
            .to_string();
            return Err(StallbookError::SlotFull { slot: label });
        }

        let total = Money::total(
            draft
                .lines
                .iter()
                .map(|(_, quantity, price)| price.times(*quantity))
                .collect::<Result<Vec<_>>>()?,
        )?;

        tx.execute(
            "INSERT INTO orders (account_id, stall_id, time_slot_id, order_date, order_time, status, total_paise, special_instructions)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                draft.account_id,
                draft.stall_id,
                draft.time_slot_id,
                date_to_sql(draft.order_date),
                draft.order_time.to_rfc3339(),
                OrderStatus::Pending.as_str(),
                total.paise(),
                draft.special_instructions
            ],
        )?;
        let order_id = tx.last_insert_rowid();

        for (food_item_id, quantity, price) in &draft.lines {
            tx.execute(
                "INSERT INTO order_items (order_id, food_item_id, quantity, price_at_order_paise)
                 VALUES (?1, ?2, ?3, ?4)",
                params![order_id, food_item_id, quantity, price.paise()],
            )?;
        }
        tx.commit()?;

        self.get_order(order_id)
    }

    pub fn get_order(&self, id: i64) -> Result<Order> {
        let sql = format!("SELECT {} FROM orders WHERE id = ?1", ORDER_COLUMNS);
        self.connection()
            .query_row(&sql, [id], order_from_row)
            .optional()?
            .ok_or_else(|| StallbookError::not_found("Order", id))
    }

    pub fn order_items(&self, order_id: i64) -> Result<Vec<OrderItem>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, order_id, food_item_id, quantity, price_at_order_paise
             FROM order_items WHERE order_id = ?1 ORDER BY id",
        )?;
        let items = stmt
            .query_map([order_id], order_item_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    pub fn orders_for_account(&self, account_id: i64) -> Result<Vec<Order>> {
        let sql = format!(
            "SELECT {} FROM orders WHERE account_id = ?1 ORDER BY order_time DESC, id DESC",
            ORDER_COLUMNS
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let orders = stmt
            .query_map([account_id], order_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    pub fn orders_on(&self, date: NaiveDate) -> Result<Vec<Order>> {
        let sql = format!(
            "SELECT {} FROM orders WHERE order_date = ?1 ORDER BY order_time DESC, id DESC",
            ORDER_COLUMNS
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let orders = stmt
            .query_map([date_to_sql(date)], order_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    pub fn set_order_status(&self, order_id: i64, status: OrderStatus) -> Result<()> {
        let changed = self.connection().execute(
            "UPDATE orders SET status = ?1 WHERE id = ?2",
            params![status.as_str(), order_id],
        )?;
        if changed == 0 {
            return Err(StallbookError::not_found("Order", order_id));
        }
        Ok(())
    }

    pub fn revenue_on(&self, date: NaiveDate) -> Result<Money> {
        let sql = format!(
            "SELECT COALESCE(SUM(total_paise), 0) FROM orders WHERE order_date = ?1 AND status IN ({})",
            status_placeholders(&OrderStatus::BILLABLE)
        );
        let paise: i64 = self
            .connection()
            .query_row(&sql, [date_to_sql(date)], |row| row.get(0))?;
        Ok(Money(paise))
    }

    // ---- demand ----

    pub fn demand_records_for_item(&self, food_item_id: i64) -> Result<Vec<DemandRecord>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, food_item_id, date, time_slot_id, day_of_week, quantity_ordered, predicted_demand
             FROM demand_records WHERE food_item_id = ?1 ORDER BY date, time_slot_id",
        )?;
        let records = stmt
            .query_map([food_item_id], demand_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// History strictly before `date`, so a day's own rows never feed its prediction.
    pub fn demand_records_before(&self, food_item_id: i64, date: NaiveDate) -> Result<Vec<DemandRecord>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, food_item_id, date, time_slot_id, day_of_week, quantity_ordered, predicted_demand
             FROM demand_records WHERE food_item_id = ?1 AND date < ?2 ORDER BY date, time_slot_id",
        )?;
        let records = stmt
            .query_map(params![food_item_id, date_to_sql(date)], demand_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Zeroes every quantity recorded on `date`; predictions are kept.
    pub fn reset_demand_quantities_on(&self, date: NaiveDate) -> Result<usize> {
        let reset = self.connection().execute(
            "UPDATE demand_records SET quantity_ordered = 0 WHERE date = ?1",
            [date_to_sql(date)],
        )?;
        Ok(reset)
    }

    /// Ordered quantity per (food item, slot) on `date`, cancelled orders excluded.
    pub fn item_quantities_on(&self, date: NaiveDate) -> Result<Vec<(i64, i64, i64)>> {
        let mut stmt = self.connection().prepare(
            "SELECT oi.food_item_id, o.time_slot_id, SUM(oi.quantity)
             FROM order_items oi
             JOIN orders o ON o.id = oi.order_id
             WHERE o.order_date = ?1 AND o.status != 'cancelled'
             GROUP BY oi.food_item_id, o.time_slot_id
             ORDER BY oi.food_item_id, o.time_slot_id",
        )?;
        let rows = stmt
            .query_map([date_to_sql(date)], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Sets (not increments) the quantity for one (item, date, slot) record.
    pub fn upsert_demand_record(
        &self,
        food_item_id: i64,
        date: NaiveDate,
        time_slot_id: i64,
        day_of_week: i64,
        quantity_ordered: i64,
        predicted_demand: i64,
    ) -> Result<()> {
        self.connection().execute(
            "INSERT INTO demand_records (food_item_id, date, time_slot_id, day_of_week, quantity_ordered, predicted_demand)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (food_item_id, date, time_slot_id) DO UPDATE SET
                 day_of_week = excluded.day_of_week,
                 quantity_ordered = excluded.quantity_ordered,
                 predicted_demand = excluded.predicted_demand",
            params![
                food_item_id,
                date_to_sql(date),
                time_slot_id,
                day_of_week,
                quantity_ordered,
                predicted_demand
            ],
        )?;
        Ok(())
    }
}
