pub mod header_page;
pub mod page;
pub mod table_page;

pub use header_page::HeaderPage;
pub use page::{Page, PageFrame, ReadPageGuard, WritePageGuard};
pub use table_page::{TablePage, TablePageError, TablePageView};
