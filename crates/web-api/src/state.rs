use std::sync::Arc;

use application::{Authenticator, DeliveryCoordinator, UserService};

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub user_service: Arc<UserService>,
    pub coordinator: Arc<DeliveryCoordinator>,
    pub authenticator: Arc<dyn Authenticator>,
    pub jwt_service: Arc<JwtService>,
}

impl AppState {
    pub fn new(
        user_service: Arc<UserService>,
        coordinator: Arc<DeliveryCoordinator>,
        authenticator: Arc<dyn Authenticator>,
        jwt_service: Arc<JwtService>,
    ) -> Self {
        Self {
            user_service,
            coordinator,
            authenticator,
            jwt_service,
        }
    }
}
