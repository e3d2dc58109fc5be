//! Data models for the invoicing engine.

pub mod directory;
pub mod document;
pub mod line_item;
pub mod payment;

pub use directory::ClientRecord;
pub use document::{
    CreateDocument, CreditLineSelection, CreditNoteMode, Document, DocumentFamily, DocumentType,
    EditDocument, InvoiceKind, LifecycleState, ListDocumentsFilter, PaymentState,
};
pub use line_item::{LineItem, LineItemInput};
pub use payment::{Payment, PaymentMethod, RecordPayment};
