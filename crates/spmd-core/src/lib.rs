pub mod attributes;
pub mod dist_attr;
pub mod errors;
pub mod merge;
pub mod mesh;
pub mod notation;
pub mod partial;
pub mod rules;
pub mod shape;
