//! Domain models for the recap service

pub mod event;
pub mod recap;

pub use event::{FetchOutcome, RecapEvent};
pub use recap::{
    payload_preview, DecodeError, FavoriteStore, ProductFavorite, RecapInput, RecapKey,
    RecapRecord, UpsertMode, UpsertReport,
};
