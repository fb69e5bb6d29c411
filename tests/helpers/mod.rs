pub mod builders;
pub mod db;

#[allow(unused_imports)]
pub use builders::*;
#[allow(unused_imports)]
pub use db::TestDb;
