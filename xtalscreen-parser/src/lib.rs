pub mod metadata;
pub mod template;
pub mod tool_output;

pub use metadata::{count_images, parse_overload, read_profile_estimate};
pub use template::{detect_templates, parse_range_argument, ImageTemplate};
pub use tool_output::{extract_bravais_table, parse_indexing_solution, parse_processor_count};
