pub mod harness;
pub mod mock_server;

pub use harness::TestHarness;
pub use mock_server::MockSmtpServer;
