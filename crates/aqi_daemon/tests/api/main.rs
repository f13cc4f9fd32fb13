mod forecast;
mod history;
mod layout;
mod weather;
mod writer;
