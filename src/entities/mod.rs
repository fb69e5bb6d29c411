pub mod activation;
pub mod activation_history;
pub mod application;
pub mod application_callback;
pub mod application_version;
pub mod integration;
pub mod master_key_pair;
pub mod recovery_code;
pub mod recovery_config;
pub mod recovery_puk;
pub mod signature_audit;
pub mod token;

pub use activation::Entity as Activation;
pub use activation_history::Entity as ActivationHistory;
pub use application::Entity as Application;
pub use application_callback::Entity as ApplicationCallback;
pub use application_version::Entity as ApplicationVersion;
pub use integration::Entity as Integration;
pub use master_key_pair::Entity as MasterKeyPair;
pub use recovery_code::Entity as RecoveryCode;
pub use recovery_config::Entity as RecoveryConfig;
pub use recovery_puk::Entity as RecoveryPuk;
pub use signature_audit::Entity as SignatureAudit;
pub use token::Entity as Token;
