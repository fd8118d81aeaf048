use crate::utils::error::{Result, StallbookError};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 金額，以 paise（盧比的百分之一）為單位儲存
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(pub i64);

impl Money {
    pub fn paise(&self) -> i64 {
        self.0
    }

    pub fn times(&self, quantity: i64) -> Result<Money> {
        self.0
            .checked_mul(quantity)
            .map(Money)
            .ok_or_else(|| overflow(format!("{} × {}", self, quantity)))
    }

    pub fn checked_add(self, other: Money) -> Result<Money> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or_else(|| overflow(format!("{} + {}", self, other)))
    }

    pub fn total<I: IntoIterator<Item = Money>>(amounts: I) -> Result<Money> {
        amounts
            .into_iter()
            .try_fold(Money::default(), |acc, amount| acc.checked_add(amount))
    }
}

fn overflow(expr: String) -> StallbookError {
    StallbookError::validation(format!("amount overflow in {}", expr))
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        write!(f, "{}₹{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = StallbookError;

    /// Parses "45", "45.5" or "45.50". More than two decimals is rejected.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('₹');
        let invalid = || StallbookError::validation(format!("invalid amount '{}'", s));

        let (whole, frac) = match trimmed.split_once('.') {
            Some((w, f)) => (w, f),
            None => (trimmed, ""),
        };
        let digits_only = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if whole.is_empty() || frac.len() > 2 || !digits_only(whole) || !digits_only(frac) {
            return Err(invalid());
        }

        let rupees: i64 = whole.parse().map_err(|_| invalid())?;
        let paise: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };

        rupees
            .checked_mul(100)
            .and_then(|p| p.checked_add(paise))
            .map(Money)
            .ok_or_else(invalid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Breakfast,
    Lunch,
    Snacks,
    Beverages,
    Dinner,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Breakfast,
        Category::Lunch,
        Category::Snacks,
        Category::Beverages,
        Category::Dinner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Breakfast => "breakfast",
            Category::Lunch => "lunch",
            Category::Snacks => "snacks",
            Category::Beverages => "beverages",
            Category::Dinner => "dinner",
        }
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::Snacks
    }
}

impl FromStr for Category {
    type Err = StallbookError;

    fn from_str(s: &str) -> Result<Self> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| StallbookError::validation(format!("unknown category '{}'", s)))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 訂單狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 6] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Preparing,
        OrderStatus::Ready,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
    ];

    /// Statuses that occupy a place in a break-time slot.
    pub const OCCUPYING: [OrderStatus; 3] =
        [OrderStatus::Pending, OrderStatus::Confirmed, OrderStatus::Ready];

    /// Statuses that count towards revenue.
    pub const BILLABLE: [OrderStatus; 4] = [
        OrderStatus::Confirmed,
        OrderStatus::Preparing,
        OrderStatus::Ready,
        OrderStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OrderStatus::Ready => "Ready for Pickup",
            OrderStatus::Pending => "Pending",
            OrderStatus::Confirmed => "Confirmed",
            OrderStatus::Preparing => "Preparing",
            OrderStatus::Completed => "Completed",
            OrderStatus::Cancelled => "Cancelled",
        }
    }
}

impl Default for OrderStatus {
    fn default() -> Self {
        OrderStatus::Pending
    }
}

impl FromStr for OrderStatus {
    type Err = StallbookError;

    fn from_str(s: &str) -> Result<Self> {
        OrderStatus::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| StallbookError::validation(format!("invalid status '{}'", s)))
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The five fixed break windows, as (stored value, display label).
pub const SLOT_CHOICES: [(&str, &str); 5] = [
    ("10:00-10:30", "10:00 AM - 10:30 AM"),
    ("12:00-12:30", "12:00 PM - 12:30 PM"),
    ("13:00-13:30", "1:00 PM - 1:30 PM"),
    ("15:00-15:30", "3:00 PM - 3:30 PM"),
    ("17:00-17:30", "5:00 PM - 5:30 PM"),
];

pub const DEFAULT_SLOT_CAPACITY: i64 = 50;

/// A login account. Students carry a profile; staff accounts usually don't.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub is_staff: bool,
    pub created_at: DateTime<Utc>,
    pub profile: Option<StudentProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub registration_number: String,
    pub phone: String,
    pub department: String,
    pub semester: i64,
}

impl Account {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.profile {
            Some(profile) => write!(f, "{} ({})", self.full_name(), profile.registration_number),
            None => f.write_str(&self.username),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stall {
    pub id: i64,
    pub name: String,
    pub location: String,
    pub description: String,
    pub is_open: bool,
    pub owner_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: i64,
    pub slot_time: String,
    pub max_capacity: i64,
}

impl TimeSlot {
    pub fn label(&self) -> &str {
        SLOT_CHOICES
            .iter()
            .find(|(value, _)| *value == self.slot_time)
            .map(|(_, label)| *label)
            .unwrap_or(self.slot_time.as_str())
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodItem {
    pub id: i64,
    pub stall_id: i64,
    pub name: String,
    pub description: String,
    pub price: Money,
    pub category: Category,
    pub is_available: bool,
    /// minutes
    pub preparation_time: i64,
}

impl fmt::Display for FoodItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.name, self.price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub account_id: i64,
    pub stall_id: i64,
    pub time_slot_id: i64,
    pub order_date: NaiveDate,
    pub order_time: DateTime<Utc>,
    pub status: OrderStatus,
    pub total_amount: Money,
    pub special_instructions: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub food_item_id: i64,
    pub quantity: i64,
    pub price_at_order: Money,
}

impl OrderItem {
    pub fn subtotal(&self) -> Result<Money> {
        self.price_at_order.times(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandRecord {
    pub id: i64,
    pub food_item_id: i64,
    pub date: NaiveDate,
    pub time_slot_id: i64,
    /// 0 = Monday, 6 = Sunday
    pub day_of_week: i64,
    pub quantity_ordered: i64,
    pub predicted_demand: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_parse_and_display() {
        assert_eq!("45".parse::<Money>().unwrap(), Money(4500));
        assert_eq!("45.5".parse::<Money>().unwrap(), Money(4550));
        assert_eq!("₹12.05".parse::<Money>().unwrap(), Money(1205));
        assert!("1.234".parse::<Money>().is_err());
        assert!("-3".parse::<Money>().is_err());
        assert!("abc".parse::<Money>().is_err());
        assert!("45.-5".parse::<Money>().is_err());
        assert!("45.+5".parse::<Money>().is_err());
        assert!("+45".parse::<Money>().is_err());
        assert!("45.".parse::<Money>().is_ok());
        assert!("99999999999999999".parse::<Money>().is_err());
        assert!(Money(i64::MAX / 2).times(3).is_err());
        assert!(Money(i64::MAX).checked_add(Money(1)).is_err());
        assert_eq!(Money::total([Money(150), Money(250)]).unwrap(), Money(400));

        assert_eq!(Money(4550).to_string(), "₹45.50");
        assert_eq!(Money(5).to_string(), "₹0.05");
    }

    #[test]
    fn test_subtotal() {
        let item = OrderItem {
            id: 1,
            order_id: 1,
            food_item_id: 1,
            quantity: 3,
            price_at_order: Money(2500),
        };
        assert_eq!(item.subtotal().unwrap(), Money(7500));
    }

    #[test]
    fn test_slot_label() {
        let slot = TimeSlot {
            id: 3,
            slot_time: "13:00-13:30".to_string(),
            max_capacity: DEFAULT_SLOT_CAPACITY,
        };
        assert_eq!(slot.to_string(), "1:00 PM - 1:30 PM");
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("ready".parse::<OrderStatus>().unwrap(), OrderStatus::Ready);
        assert!("shipped".parse::<OrderStatus>().is_err());
        assert_eq!(OrderStatus::Ready.label(), "Ready for Pickup");
    }
}
