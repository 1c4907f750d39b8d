//! Follow graph ownership
pub mod social_graph;

pub use social_graph::SocialGraph;
