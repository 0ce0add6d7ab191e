pub mod stage0_convert;
pub mod stage1_extract;
pub mod stage2_providers;
pub mod stage3_panel;
pub mod stage4_amalgamate;
pub mod stage5_master;
pub mod stage6_coverage;

pub use stage0_convert::*;
pub use stage1_extract::*;
pub use stage2_providers::*;
pub use stage3_panel::*;
pub use stage4_amalgamate::*;
pub use stage5_master::*;
pub use stage6_coverage::*;
