use crate::service::Service;

#[derive(Clone)]
pub struct AppState {
    pub service: Service,
}
