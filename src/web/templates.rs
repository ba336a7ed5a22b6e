use askama::Template;

#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {
    pub authenticated: bool,
    pub expired: bool,
    pub username: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
}

#[derive(Template)]
#[template(path = "protected.html")]
pub struct ProtectedTemplate {
    pub username: String,
    pub expires_in_secs: u64,
    /// Pretty-printed ID token claims
    pub claims_json: String,
}
