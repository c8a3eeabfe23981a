pub mod http_server;
pub mod mock_repo_data;
pub mod pypi_index;
