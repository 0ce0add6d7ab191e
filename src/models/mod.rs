pub mod category;
pub mod panel;
pub mod provider;
pub mod sheet;
pub mod table;

pub use category::*;
pub use panel::*;
pub use provider::*;
pub use sheet::*;
pub use table::*;
