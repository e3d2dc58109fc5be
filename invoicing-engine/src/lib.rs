//! Invoice document engine: legally-numbered billing documents with gapless
//! sequencing, derived monetary totals, lifecycle enforcement, credit notes,
//! rectificative invoices and a payment ledger.

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
