pub mod process;
pub mod scrape;
