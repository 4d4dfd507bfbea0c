//! Branch action names for the user/article update.

/// Action name of the user branch (last-login-time update).
pub const USER_LAST_LOGIN: &str = "user_last_login_time";

/// Action name of the article branch (field update).
pub const ARTICLE_UPDATE: &str = "article_update";
