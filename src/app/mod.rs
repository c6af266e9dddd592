mod bookmarks;
mod cli;
mod data_io;
mod error;
mod lifecycle;
mod persistence;
mod probe;
mod proxy;
mod runtime;
mod scheduler;
mod settings;
mod store;
#[cfg(test)]
mod testing;
mod tui;
mod types;
mod ui_utils;

pub use runtime::run;
