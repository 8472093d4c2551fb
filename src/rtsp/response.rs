use super::headers::Headers;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 200,
    BadRequest = 400,
    Unauthorized = 401,
    ParameterNotUnderstood = 451,
    NotEnoughBandwidth = 453,
}

impl StatusCode {
    // sources only care whether the request succeeded
    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            _ => "Error",
        }
    }
}

pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
        }
    }
}
