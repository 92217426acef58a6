pub mod account;
pub mod auth_admin;
pub mod booking_notification;
pub mod email;
pub mod lenco;
pub mod operator;
pub mod otp;
pub mod payment;

pub use account::AccountService;
pub use auth_admin::AuthAdminClient;
pub use booking_notification::BookingNotificationService;
pub use email::EmailService;
pub use lenco::LencoClient;
pub use otp::{OtpPolicy, OtpService};
pub use payment::PaymentService;
