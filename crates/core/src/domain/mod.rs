pub mod candidate;
pub mod cpt;
pub mod evidence;
pub mod registry;
