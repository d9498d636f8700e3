pub mod ir;
pub mod target;

pub use ir::layout::DataLayout;
pub use ir::opt::vectorize;
pub use ir::opt::Engine;
pub use target::TargetInfo;
