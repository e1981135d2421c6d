pub mod backfill;

pub mod util {
    pub mod db;
    pub mod env;
}
