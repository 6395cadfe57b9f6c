mod doc;
mod status;

pub use doc::DocCommand;
pub use status::StatusCommand;
