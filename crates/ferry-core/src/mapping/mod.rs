pub mod resolver;
pub mod table;

pub use resolver::{FallbackSubstitution, MappingResolver, Translation};
pub use table::{DefaultPolicy, FieldCategory, MappingRule, MappingTable};
