use crate::app::demand::{self, DemandPredictor, DASHBOARD_SLOT_INDEX};
use crate::domain::model::{
    Account, FoodItem, Money, Order, OrderItem, OrderStatus, Stall, StudentProfile, TimeSlot,
};
use crate::store::queries::{MenuFilter, NewAccount, OrderDraft};
use crate::store::Store;
use crate::utils::error::{Result, StallbookError};
use crate::utils::validation::{validate_non_empty_string, validate_range};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

pub const MAX_QUANTITY_PER_ADD: i64 = 10;
pub const DASHBOARD_PREDICTION_ITEMS: usize = 5;
const BUSY_SLOT_ORDERS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Menu {
    pub stalls: Vec<Stall>,
    pub items: Vec<FoodItem>,
}

pub fn menu(store: &Store, filter: &MenuFilter) -> Result<Menu> {
    Ok(Menu {
        stalls: store.open_stalls()?,
        items: store.available_items(filter)?,
    })
}

/// 購物車：一次只能向同一個攤位點餐
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cart {
    stall_id: Option<i64>,
    lines: BTreeMap<i64, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CartLine {
    pub item: FoodItem,
    pub quantity: i64,
    pub subtotal: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CartView {
    pub lines: Vec<CartLine>,
    pub total: Money,
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stall_id(&self) -> Option<i64> {
        self.stall_id
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Total number of portions across all lines.
    pub fn count(&self) -> i64 {
        self.lines.values().sum()
    }

    pub fn quantity_of(&self, item_id: i64) -> i64 {
        self.lines.get(&item_id).copied().unwrap_or(0)
    }

    pub fn add(&mut self, item: &FoodItem, quantity: i64) -> Result<()> {
        if !item.is_available {
            return Err(StallbookError::not_found("Food item", item.id));
        }
        validate_range("quantity", quantity, 1, MAX_QUANTITY_PER_ADD)?;

        if let Some(stall_id) = self.stall_id {
            if stall_id != item.stall_id {
                return Err(StallbookError::CartConflict {
                    message: "You can only order from one stall at a time".to_string(),
                });
            }
        }

        *self.lines.entry(item.id).or_insert(0) += quantity;
        self.stall_id = Some(item.stall_id);
        Ok(())
    }

    /// Returns whether the item was in the cart. An emptied cart forgets its stall.
    pub fn remove(&mut self, item_id: i64) -> bool {
        let removed = self.lines.remove(&item_id).is_some();
        if self.lines.is_empty() {
            self.stall_id = None;
        }
        removed
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.stall_id = None;
    }

    /// Priced view of the cart. Items deleted since they were added are skipped.
    pub fn view(&self, store: &Store) -> Result<CartView> {
        let mut lines = Vec::new();
        for (&item_id, &quantity) in &self.lines {
            match store.get_food_item(item_id) {
                Ok(item) => {
                    let subtotal = item.price.times(quantity)?;
                    lines.push(CartLine {
                        item,
                        quantity,
                        subtotal,
                    });
                }
                Err(StallbookError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        let total = Money::total(lines.iter().map(|l| l.subtotal))?;
        Ok(CartView { lines, total })
    }
}

/// Places the cart as one order for `today`. The cart is cleared on success.
pub fn place_order(
    store: &mut Store,
    account_id: i64,
    cart: &mut Cart,
    time_slot_id: i64,
    special_instructions: &str,
    today: NaiveDate,
) -> Result<Order> {
    let stall_id = match cart.stall_id() {
        Some(stall_id) if !cart.is_empty() => stall_id,
        _ => return Err(StallbookError::validation("Your cart is empty")),
    };

    store.get_account(account_id)?;
    store.get_stall(stall_id)?;

    let mut lines = Vec::with_capacity(cart.lines.len());
    for (&item_id, &quantity) in &cart.lines {
        let item = store.get_food_item(item_id)?;
        lines.push((item.id, quantity, item.price));
    }

    let draft = OrderDraft {
        account_id,
        stall_id,
        time_slot_id,
        order_date: today,
        order_time: Utc::now(),
        special_instructions: special_instructions.trim().to_string(),
        lines,
    };
    let order = store.create_order(&draft)?;

    tracing::info!(
        "🧾 Order #{} placed by account {} for slot {} ({})",
        order.id,
        account_id,
        time_slot_id,
        order.total_amount
    );
    cart.clear();
    Ok(order)
}

/// The account's own order with its lines. Other accounts' orders are reported as missing.
pub fn order_details(store: &Store, account_id: i64, order_id: i64) -> Result<(Order, Vec<OrderItem>)> {
    let order = store.get_order(order_id)?;
    if order.account_id != account_id {
        return Err(StallbookError::not_found("Order", order_id));
    }
    let items = store.order_items(order_id)?;
    Ok((order, items))
}

pub fn orders_for(store: &Store, account_id: i64) -> Result<Vec<Order>> {
    store.orders_for_account(account_id)
}

/// Only pending orders can be cancelled, and only by the account that placed them.
pub fn cancel_order(store: &Store, account_id: i64, order_id: i64) -> Result<Order> {
    let (order, _) = order_details(store, account_id, order_id)?;
    if order.status != OrderStatus::Pending {
        return Err(StallbookError::InvalidTransition {
            order_id,
            from: order.status.to_string(),
            to: OrderStatus::Cancelled.to_string(),
        });
    }
    store.set_order_status(order_id, OrderStatus::Cancelled)?;
    tracing::info!("🚫 Order #{} cancelled", order_id);
    store.get_order(order_id)
}

fn require_staff(store: &Store, actor_id: i64) -> Result<Account> {
    let actor = store.get_account(actor_id)?;
    if !actor.is_staff {
        return Err(StallbookError::PermissionDenied {
            message: format!("account {} is not staff", actor_id),
        });
    }
    Ok(actor)
}

/// Staff may set any valid status.
pub fn update_status(store: &Store, actor_id: i64, order_id: i64, status: &str) -> Result<Order> {
    require_staff(store, actor_id)?;
    let status: OrderStatus = status.parse()?;
    store.get_order(order_id)?;
    store.set_order_status(order_id, status)?;
    tracing::info!("🔄 Order #{} is now {}", order_id, status.label());
    store.get_order(order_id)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemPrediction {
    pub item: FoodItem,
    pub predicted_demand: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub date: NaiveDate,
    pub orders: Vec<Order>,
    pub total_orders: usize,
    pub revenue: Money,
    pub slot_demand: Vec<(TimeSlot, i64)>,
    pub predictions: Vec<ItemPrediction>,
}

pub fn dashboard(store: &Store, actor_id: i64, today: NaiveDate) -> Result<Dashboard> {
    require_staff(store, actor_id)?;

    let orders = store.orders_on(today)?;
    let predictions = store
        .available_items(&MenuFilter::default())?
        .into_iter()
        .take(DASHBOARD_PREDICTION_ITEMS)
        .map(|item| {
            let predictor = demand::predictor_for_item(store, item.id)?;
            Ok(ItemPrediction {
                predicted_demand: predictor.predict_on(today, DASHBOARD_SLOT_INDEX),
                item,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Dashboard {
        date: today,
        total_orders: orders.len(),
        orders,
        revenue: store.revenue_on(today)?,
        slot_demand: store.slot_order_counts(today)?,
        predictions,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotLoad {
    pub slot: TimeSlot,
    pub current_orders: i64,
    pub predicted: i64,
    pub percentage: i64,
    pub is_peak: bool,
}

pub fn peak_times(store: &Store, today: NaiveDate) -> Result<Vec<SlotLoad>> {
    // campus-wide view, not tied to one item's history
    let predictor = DemandPredictor::new();

    store
        .time_slots()?
        .into_iter()
        .map(|slot| {
            let current_orders = store.occupying_orders(slot.id, today)?;
            let predicted = predictor.predict_on(today, slot.id);
            let percentage = if slot.max_capacity > 0 {
                (current_orders * 100 / slot.max_capacity).min(100)
            } else {
                100
            };
            Ok(SlotLoad {
                is_peak: predicted > demand::PEAK_THRESHOLD || current_orders > BUSY_SLOT_ORDERS,
                current_orders,
                predicted,
                percentage,
                slot,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub registration_number: String,
    pub phone: String,
    pub department: String,
    pub semester: i64,
}

pub fn register_student(store: &mut Store, form: &Registration) -> Result<Account> {
    validate_non_empty_string("username", &form.username)?;
    validate_non_empty_string("first_name", &form.first_name)?;
    validate_non_empty_string("last_name", &form.last_name)?;
    validate_non_empty_string("registration_number", &form.registration_number)?;
    validate_non_empty_string("phone", &form.phone)?;
    validate_non_empty_string("department", &form.department)?;
    validate_range("semester", form.semester, 1, 10)?;
    if !form.email.contains('@') {
        return Err(StallbookError::validation(format!(
            "'{}' is not an email address",
            form.email
        )));
    }

    if store.username_taken(&form.username)? {
        return Err(StallbookError::validation(format!(
            "username '{}' is already taken",
            form.username
        )));
    }
    if store.registration_number_taken(&form.registration_number)? {
        return Err(StallbookError::validation(format!(
            "registration number '{}' is already registered",
            form.registration_number
        )));
    }

    let id = store.insert_account(&NewAccount {
        username: form.username.trim().to_string(),
        first_name: form.first_name.trim().to_string(),
        last_name: form.last_name.trim().to_string(),
        email: form.email.trim().to_string(),
        is_staff: false,
        profile: Some(StudentProfile {
            registration_number: form.registration_number.trim().to_string(),
            phone: form.phone.trim().to_string(),
            department: form.department.trim().to_string(),
            semester: form.semester,
        }),
    })?;
    store.get_account(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::Category;

    fn item(id: i64, stall_id: i64, price: i64) -> FoodItem {
        FoodItem {
            id,
            stall_id,
            name: format!("item-{}", id),
            description: String::new(),
            price: Money(price),
            category: Category::Snacks,
            is_available: true,
            preparation_time: 10,
        }
    }

    #[test]
    fn test_cart_single_stall() {
        let mut cart = Cart::new();
        cart.add(&item(1, 1, 2000), 2).unwrap();
        cart.add(&item(1, 1, 2000), 1).unwrap();
        assert_eq!(cart.quantity_of(1), 3);

        let err = cart.add(&item(2, 2, 1500), 1).unwrap_err();
        assert!(matches!(err, StallbookError::CartConflict { .. }));
        assert_eq!(cart.count(), 3);
    }

    #[test]
    fn test_cart_forgets_stall_when_emptied() {
        let mut cart = Cart::new();
        cart.add(&item(1, 1, 2000), 1).unwrap();
        assert!(cart.remove(1));
        assert!(!cart.remove(1));
        assert_eq!(cart.stall_id(), None);
        cart.add(&item(2, 2, 1500), 1).unwrap();
        assert_eq!(cart.stall_id(), Some(2));
    }

    #[test]
    fn test_cart_quantity_bounds() {
        let mut cart = Cart::new();
        assert!(cart.add(&item(1, 1, 100), 0).is_err());
        assert!(cart.add(&item(1, 1, 100), 11).is_err());
        let mut unavailable = item(3, 1, 100);
        unavailable.is_available = false;
        assert!(cart.add(&unavailable, 1).is_err());
        assert!(cart.is_empty());
    }
}
