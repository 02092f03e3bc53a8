//! Domain models for the sales ledger.

pub mod account;
pub mod cash;
pub mod group;
pub mod invoice;
pub mod payment;

pub use account::{Account, AccountKey};
pub use cash::{IncomeEntry, RecordCashEntry, Withdrawal};
pub use group::{CreateGroup, Group, UpdateGroup};
pub use invoice::{CreateInvoice, Invoice, InvoiceStatus, LineItem, PaymentKind, BALANCE_EPSILON};
pub use payment::{Allocation, Payment, PaymentOrigin};
